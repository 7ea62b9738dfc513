
use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;
use test_harness::{assert_eventually, gated_command, TestDispatcher, WAIT};
use tool_dispatch::config::{DispatcherConfig, ServerConfig};
use tool_dispatch::scheduler::{JobOutcome, JobRecord, JobStatus};
use tool_dispatch::{DispatchError, UploadedFile};

fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn open_gate(gate: &std::path::Path) {
    std::fs::write(gate, b"").unwrap();
}

#[tokio::test]
async fn test_ids_are_sequential() {
    let t = TestDispatcher::start(1).await;

    assert_eq!(t.submit("true").await, 0);
    assert_eq!(t.submit("true").await, 1);
    assert_eq!(t.submit("true").await, 2);

    for id in 0..3 {
        t.wait_completed(id).await;
        assert!(t.root().join(id.to_string()).is_dir());
    }
}

#[tokio::test]
async fn test_successful_job_result() {
    let t = TestDispatcher::start(1).await;
    let id = t.submit("echo hello").await;

    let job = t.wait_completed(id).await;
    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert!(job.completed_at.is_some());
    assert_eq!(t.handle.fetch_result_text(id).await.unwrap(), "hello\n");
}

#[tokio::test]
async fn test_failed_job_result_is_stderr() {
    let t = TestDispatcher::start(1).await;
    let id = t.submit("printf boom >&2; exit 1").await;

    let job = t.wait_completed(id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outcome, Some(JobOutcome::Failed { exit_code: Some(1) }));
    assert_eq!(t.handle.fetch_result_text(id).await.unwrap(), "boom");
    assert!(!job.stdout_path().exists());
}

#[tokio::test]
async fn test_result_of_unfinished_job() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start(1).await;
    let id = t.submit(&gated_command(&gate, "true")).await;

    assert!(matches!(
        t.handle.fetch_result_text(id).await,
        Err(DispatchError::JobNotFound(_))
    ));
    assert!(matches!(
        t.handle.fetch_result_text(99).await,
        Err(DispatchError::JobNotFound(99))
    ));

    open_gate(&gate);
    t.wait_completed(id).await;
}

#[tokio::test]
async fn test_fifo_dispatch_with_bounded_pool() {
    let gates = TempDir::new().unwrap();
    let gate = |id: u64| gates.path().join(format!("gate{}", id));
    let t = TestDispatcher::start(2).await;

    for id in 0..3u64 {
        let submitted = t.submit(&gated_command(&gate(id), "true")).await;
        assert_eq!(submitted, id);
    }

    assert_eq!(t.job_status(0).await, Some(JobStatus::Processing));
    assert_eq!(t.job_status(1).await, Some(JobStatus::Processing));
    assert_eq!(t.job_status(2).await, Some(JobStatus::Pending));

    let status = t.handle.status().await.unwrap();
    assert_eq!(status.pending.len(), 3);
    assert!(status.completed.is_empty());

    open_gate(&gate(1));
    t.wait_completed(1).await;
    assert_eventually(
        || async { t.job_status(2).await == Some(JobStatus::Processing) },
        WAIT,
        "job 2 should take the freed slot",
    )
    .await;
    assert_eq!(t.job_status(0).await, Some(JobStatus::Processing));

    open_gate(&gate(0));
    open_gate(&gate(2));
    t.wait_completed(0).await;
    t.wait_completed(2).await;

    let status = t.handle.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(status.completed.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_marker_tracks_job() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start(1).await;
    let id = t.submit(&gated_command(&gate, "echo done")).await;

    let job = t.handle.get_job(id).await.unwrap().unwrap();
    let marker = job.marker_path();
    assert!(marker.starts_with(t.root().join("0")));
    let on_disk = JobRecord::read_marker(&marker).await.unwrap();
    assert_eq!(on_disk.id, id);
    assert_eq!(on_disk.command, job.command);
    assert_eq!(on_disk.created_at, job.created_at);
    assert!(on_disk.outcome.is_none());

    open_gate(&gate);
    let done = t.wait_completed(id).await;
    let on_disk = JobRecord::read_marker(&marker).await.unwrap();
    assert_eq!(on_disk.status, JobStatus::Completed);
    assert_eq!(on_disk.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(on_disk, done);
}

#[tokio::test]
async fn test_delete_unknown_job_is_noop() {
    let t = TestDispatcher::start(1).await;
    t.handle.delete_completed(42).await.unwrap();

    let id = t.submit("true").await;
    t.wait_completed(id).await;
    t.handle.delete_completed(42).await.unwrap();
    assert!(t.handle.get_job(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_completed_job() {
    let t = TestDispatcher::start(1).await;
    let id = t.submit("echo bye").await;
    t.wait_completed(id).await;

    t.handle.delete_completed(id).await.unwrap();

    assert!(!t.root().join(id.to_string()).exists());
    assert!(t.handle.get_job(id).await.unwrap().is_none());
    assert!(t.handle.status().await.unwrap().completed.is_empty());
    // Deleting twice is harmless.
    t.handle.delete_completed(id).await.unwrap();
}

#[tokio::test]
async fn test_delete_running_job_is_ignored() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start(1).await;
    let id = t.submit(&gated_command(&gate, "true")).await;

    t.handle.delete_completed(id).await.unwrap();
    assert_eq!(t.job_status(id).await, Some(JobStatus::Processing));
    assert!(t.root().join(id.to_string()).is_dir());

    open_gate(&gate);
    t.wait_completed(id).await;
}

#[tokio::test]
async fn test_status_hides_externally_removed_jobs() {
    let t = TestDispatcher::start(1).await;
    let kept = t.submit("true").await;
    let removed = t.submit("true").await;
    t.wait_completed(kept).await;
    t.wait_completed(removed).await;

    std::fs::remove_dir_all(t.root().join(removed.to_string())).unwrap();

    let status = t.handle.status().await.unwrap();
    assert!(status.completed.contains_key(&kept));
    assert!(!status.completed.contains_key(&removed));
}

#[tokio::test]
async fn test_missing_input_is_rejected() {
    let t = TestDispatcher::start(1).await;

    let result = t.handle.submit("cat INPUT1", BTreeMap::new(), Vec::new()).await;
    assert!(matches!(result, Err(DispatchError::MissingInput(name)) if name == "INPUT1"));

    // Nothing was queued and the id is reused.
    let status = t.handle.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert!(!t.root().join("0").exists());
    assert_eq!(t.submit("true").await, 0);
}

#[tokio::test]
async fn test_reserved_file_name_is_rejected() {
    let t = TestDispatcher::start(1).await;
    let upload = UploadedFile::from_bytes("INPUT1", "request_0_1_info.json", "{}");

    let result = t
        .handle
        .submit("cat INPUT1", BTreeMap::new(), vec![upload])
        .await;

    assert!(matches!(result, Err(DispatchError::InvalidFileName(_))));
    assert!(t.handle.status().await.unwrap().pending.is_empty());
}

#[tokio::test]
async fn test_duplicate_input_is_rejected() {
    let t = TestDispatcher::start(1).await;
    let upload = UploadedFile::from_bytes("INPUT1", "a.txt", "a");

    let result = t
        .handle
        .submit("cat INPUT1", fields(&[("INPUT1", "b")]), vec![upload])
        .await;

    assert!(matches!(result, Err(DispatchError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_field_values_are_quoted() {
    let t = TestDispatcher::start(1).await;

    let id = t
        .handle
        .submit(
            "printf '%s|' INPUT1 INPUT2",
            fields(&[("INPUT1", "hello world"), ("INPUT2", "x; touch pwned")]),
            Vec::new(),
        )
        .await
        .unwrap();
    let job = t.wait_completed(id).await;

    assert_eq!(
        t.handle.fetch_result_text(id).await.unwrap(),
        "hello world|x; touch pwned|"
    );
    assert!(!job.work_dir.join("pwned").exists());
}

#[tokio::test]
async fn test_uploaded_bytes_are_consumed() {
    let t = TestDispatcher::start(1).await;
    let upload = UploadedFile::from_bytes("INPUT1", "../../data.txt", "payload");

    let id = t
        .handle
        .submit("cat INPUT1", BTreeMap::new(), vec![upload])
        .await
        .unwrap();
    let job = t.wait_completed(id).await;

    let input = t.root().join("0").join("data.txt");
    assert_eq!(job.inputs["INPUT1"], input.to_string_lossy());
    assert!(job
        .input_file_timestamps
        .contains_key(&*input.to_string_lossy()));
    assert_eq!(t.handle.fetch_result_text(id).await.unwrap(), "payload");
    assert!(!input.exists());
}

#[tokio::test]
async fn test_upload_from_path_copies_file() {
    let source_dir = TempDir::new().unwrap();
    let source = source_dir.path().join("notes.txt");
    std::fs::write(&source, "from disk").unwrap();
    let t = TestDispatcher::start(1).await;

    let id = t
        .handle
        .submit(
            "wc -c < INPUT1",
            BTreeMap::new(),
            vec![UploadedFile::from_path("INPUT1", &source)],
        )
        .await
        .unwrap();
    t.wait_completed(id).await;

    assert_eq!(t.handle.fetch_result_text(id).await.unwrap().trim(), "9");
    assert!(source.exists());
}

#[tokio::test]
async fn test_unreadable_upload_path_is_rejected() {
    let t = TestDispatcher::start(1).await;
    let upload = UploadedFile::from_path("INPUT1", "/nonexistent/input.txt");

    let result = t
        .handle
        .submit("cat INPUT1", BTreeMap::new(), vec![upload])
        .await;

    assert!(matches!(result, Err(DispatchError::Io(_))));
    assert!(t.handle.status().await.unwrap().pending.is_empty());
    assert!(!t.root().join("0").exists());
}

#[tokio::test]
async fn test_submit_tool() {
    let t = TestDispatcher::start(1).await;
    let catalog = ServerConfig::from_json(
        r#"{
            "name": "text",
            "directory": "/unused",
            "tools": { "text": { "Repeat": {
                "command": "printf '%s ' INPUT1 INPUT2",
                "inputs": [
                    { "id": "INPUT1", "kind": "STR" },
                    { "id": "INPUT2", "kind": "NUM" }
                ]
            } } }
        }"#,
    )
    .unwrap();
    let handle = t.handle.clone().with_tools(catalog);

    assert!(matches!(
        handle
            .submit_tool("text/Missing", BTreeMap::new(), Vec::new())
            .await,
        Err(DispatchError::UnknownTool(_))
    ));
    assert!(matches!(
        handle
            .submit_tool("text/Repeat", fields(&[("INPUT1", "a")]), Vec::new())
            .await,
        Err(DispatchError::MissingInput(_))
    ));
    assert!(matches!(
        handle
            .submit_tool(
                "text/Repeat",
                fields(&[("INPUT1", "a"), ("INPUT2", "two")]),
                Vec::new()
            )
            .await,
        Err(DispatchError::InvalidInput { .. })
    ));

    let id = handle
        .submit_tool(
            "text/Repeat",
            fields(&[("INPUT1", "a"), ("INPUT2", "2")]),
            Vec::new(),
        )
        .await
        .unwrap();
    let job = t.wait_completed(id).await;
    assert_eq!(job.tool.as_deref(), Some("text/Repeat"));
    assert_eq!(job.template, "printf '%s ' INPUT1 INPUT2");
    assert_eq!(handle.fetch_result_text(id).await.unwrap(), "a 2 ");
}

#[tokio::test]
async fn test_submit_tool_without_catalog() {
    let t = TestDispatcher::start(1).await;
    assert!(matches!(
        t.handle
            .submit_tool("text/Repeat", BTreeMap::new(), Vec::new())
            .await,
        Err(DispatchError::UnknownTool(_))
    ));
}

#[tokio::test]
async fn test_job_timeout() {
    let t = TestDispatcher::start_with(|root| {
        DispatcherConfig::new(root, 1).with_job_timeout(Duration::from_millis(200))
    })
    .await;

    let id = t.submit("sleep 5").await;
    let job = t.wait_completed(id).await;

    assert!(matches!(job.outcome, Some(JobOutcome::TimedOut { .. })));
    assert!(t
        .handle
        .fetch_result_text(id)
        .await
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn test_queue_capacity_is_enforced() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start_with(|root| DispatcherConfig::new(root, 1).with_max_pending(1))
        .await;

    let running = t.submit(&gated_command(&gate, "true")).await;
    let queued = t.submit(&gated_command(&gate, "true")).await;
    let result = t.handle.submit("true", BTreeMap::new(), Vec::new()).await;
    assert!(matches!(result, Err(DispatchError::QueueFull(1))));
    // The rejected submission left nothing on disk and gave up no id.
    assert!(!t.root().join("2").exists());

    open_gate(&gate);
    t.wait_completed(running).await;
    t.wait_completed(queued).await;
    assert_eq!(t.submit("true").await, 2);
}

#[tokio::test]
async fn test_existing_directory_is_skipped() {
    let t = TestDispatcher::start(1).await;
    std::fs::create_dir(t.root().join("0")).unwrap();
    std::fs::create_dir(t.root().join("1")).unwrap();

    let id = t.submit("echo fresh").await;
    assert_eq!(id, 2);
    t.wait_completed(id).await;
    assert_eq!(t.handle.fetch_result_text(id).await.unwrap(), "fresh\n");

    // Skipped ids stay skipped.
    assert_eq!(t.submit("true").await, 3);
    assert!(t.handle.get_job(0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_marker_round_trip_with_inputs() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start(1).await;
    let template = format!("{} INPUT1 INPUT2", gated_command(&gate, "printf '%s|'"));

    let id = t
        .handle
        .submit(
            &template,
            fields(&[("INPUT1", "two words")]),
            vec![UploadedFile::from_bytes("INPUT2", "data.txt", "payload")],
        )
        .await
        .unwrap();

    let job = t.handle.get_job(id).await.unwrap().unwrap();
    let on_disk = JobRecord::read_marker(&job.marker_path()).await.unwrap();
    let upload = t.root().join("0").join("data.txt");
    assert_eq!(on_disk.inputs.len(), 2);
    assert_eq!(on_disk.inputs["INPUT1"], "two words");
    assert_eq!(on_disk.inputs["INPUT2"], upload.to_string_lossy());
    assert_eq!(on_disk.input_file_timestamps, job.input_file_timestamps);
    assert_eq!(on_disk.input_file_timestamps.len(), 1);
    assert_eq!(on_disk.template, template);
    assert_eq!(on_disk.command, job.command);
    assert_eq!(on_disk.status, JobStatus::Pending);

    open_gate(&gate);
    let done = t.wait_completed(id).await;
    let on_disk = JobRecord::read_marker(&job.marker_path()).await.unwrap();
    assert_eq!(on_disk, done);
    assert_eq!(on_disk.inputs, job.inputs);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_jobs() {
    let gates = TempDir::new().unwrap();
    let gate = gates.path().join("gate");
    let t = TestDispatcher::start(1).await;
    let running = t.submit(&gated_command(&gate, "echo finished")).await;
    let queued = t.submit("echo never").await;

    let handle = t.handle.clone();
    let shutdown = tokio::spawn(async move { handle.shutdown().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!shutdown.is_finished());

    open_gate(&gate);
    tokio::time::timeout(WAIT, shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let dir = t.root().join(running.to_string());
    let marker = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.to_string_lossy().ends_with("_info.json"))
        .unwrap();
    let job = JobRecord::read_marker(&marker).await.unwrap();
    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));

    // The queued job never ran.
    let never = t.root().join(queued.to_string());
    assert!(!std::fs::read_dir(&never)
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().ends_with("_stdout.txt")));

    assert!(matches!(
        t.handle.status().await,
        Err(DispatchError::ChannelClosed)
    ));
}
