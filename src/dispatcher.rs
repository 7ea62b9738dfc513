use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::{DispatcherConfig, ServerConfig};
use crate::error::{DispatchError, Result};
use crate::scheduler::job::modified_at;
use crate::scheduler::recovery::scan_job_root;
use crate::scheduler::template::render_command;
use crate::scheduler::{JobId, JobOutcome, JobQueue, JobRecord, JobStatus, SlotTable};
use crate::worker::{JobExecutor, WorkerPool, WorkerReport};

/// Where the bytes of an uploaded file come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    /// Copied into the job's working directory at submission.
    Path(PathBuf),
}

/// A file bound to an input slot of a submission.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub input: String,
    pub file_name: String,
    pub source: UploadSource,
}

impl UploadedFile {
    pub fn from_bytes(
        input: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            input: input.into(),
            file_name: file_name.into(),
            source: UploadSource::Bytes(data.into()),
        }
    }

    /// Upload an existing file under its own name.
    pub fn from_path(input: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            input: input.into(),
            file_name,
            source: UploadSource::Path(path),
        }
    }
}

#[derive(Debug)]
pub struct SubmitRequest {
    pub template: String,
    pub tool: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub uploads: Vec<UploadedFile>,
}

/// Copies of the job tables at the time of a status query.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// Queued and processing jobs; `status` tells them apart.
    pub pending: BTreeMap<JobId, JobRecord>,
    /// Completed jobs whose working directory still exists.
    pub completed: BTreeMap<JobId, JobRecord>,
}

/// Message types for the dispatcher event loop
#[derive(Debug)]
pub enum DispatchMessage {
    Submit {
        request: SubmitRequest,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    Status {
        response_tx: oneshot::Sender<StatusSnapshot>,
    },
    GetJob {
        job_id: JobId,
        response_tx: oneshot::Sender<Option<JobRecord>>,
    },
    DeleteCompleted {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<bool>>,
    },
    /// Stop accepting work, let in-flight jobs finish, then exit.
    Shutdown { response_tx: oneshot::Sender<()> },
}

/// Owns the queue, the slot table and every job record.
///
/// Runs as a single task; callers talk to it through a [`DispatcherHandle`] and
/// workers report back over their own channel, so its state is never shared.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: JobQueue,
    slots: SlotTable,
    pool: Option<WorkerPool>,
    next_id: JobId,
}

impl Dispatcher {
    /// Recover completed jobs from the job root, start the worker pool and the
    /// dispatcher loop.
    pub async fn start(mut config: DispatcherConfig) -> Result<DispatcherHandle> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.root).await?;
        // Commands run inside their job directory, so every stored path must be absolute.
        config.root = tokio::fs::canonicalize(&config.root).await?;

        let recovered = scan_job_root(&config.root).await?;
        let mut queue = JobQueue::with_capacity(config.max_pending);
        for job in recovered.jobs {
            queue.restore_completed(job);
        }

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(
            config.workers,
            JobExecutor::with_timeout(config.job_timeout),
            report_tx,
        );

        let dispatcher = Self {
            slots: SlotTable::new(config.workers),
            queue,
            pool: Some(pool),
            next_id: recovered.next_id,
            config,
        };

        let root = dispatcher.config.root.clone();
        let (message_tx, message_rx) = mpsc::channel(100);
        tokio::spawn(dispatcher.run(message_rx, report_rx));

        Ok(DispatcherHandle {
            message_tx,
            root,
            tools: None,
        })
    }

    async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<DispatchMessage>,
        mut report_rx: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        tracing::info!(
            root = %self.config.root.display(),
            workers = self.slots.len(),
            next_id = self.next_id,
            "Dispatcher started"
        );

        let done_tx = loop {
            tokio::select! {
                msg = message_rx.recv() => match msg {
                    Some(DispatchMessage::Shutdown { response_tx }) => break Some(response_tx),
                    Some(msg) => self.handle_message(msg).await,
                    None => break None,
                },
                Some(report) = report_rx.recv() => {
                    self.on_worker_complete(report).await;
                }
            }
        };

        self.drain(report_rx).await;
        if let Some(tx) = done_tx {
            let _ = tx.send(());
        }
    }

    async fn handle_message(&mut self, msg: DispatchMessage) {
        match msg {
            DispatchMessage::Submit {
                request,
                response_tx,
            } => {
                let result = self.submit(request).await;
                let _ = response_tx.send(result);
            }
            DispatchMessage::Status { response_tx } => {
                let _ = response_tx.send(self.status().await);
            }
            DispatchMessage::GetJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.queue.get_job(job_id).cloned());
            }
            DispatchMessage::DeleteCompleted {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.delete_completed(job_id).await);
            }
            DispatchMessage::Shutdown { .. } => {}
        }
    }

    /// Persist a new job and queue it.
    ///
    /// On any error the job is not enqueued and its directory is removed.
    async fn submit(&mut self, request: SubmitRequest) -> Result<JobId> {
        if self.queue.is_full() {
            return Err(DispatchError::QueueFull(self.queue.len()));
        }

        let (id, following, work_dir) = self.create_job_dir().await?;
        let job = match prepare_job(id, work_dir.clone(), request).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "Submission rejected");
                self.discard_job_dir(id, following, &work_dir).await;
                return Err(e);
            }
        };

        tracing::info!(job_id = id, command = %job.command, "Job submitted");
        if !self.queue.enqueue(job) {
            tracing::warn!(job_id = id, "Queue filled up during submission");
            self.discard_job_dir(id, following, &work_dir).await;
            return Err(DispatchError::QueueFull(self.queue.len()));
        }
        self.next_id = following;
        self.dispatch().await;
        Ok(id)
    }

    /// Create the directory of the next free id. Ids whose directory already
    /// exists are skipped for good. Returns the id, the id after it and the directory.
    async fn create_job_dir(&mut self) -> Result<(JobId, JobId, PathBuf)> {
        loop {
            let id = self.next_id;
            // The last id is never handed out, so `next_id` can always move past a job.
            let following = id.checked_add(1).ok_or(DispatchError::IdsExhausted)?;
            let work_dir = self.config.root.join(id.to_string());

            match tokio::fs::create_dir(&work_dir).await {
                Ok(()) => return Ok((id, following, work_dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::warn!(job_id = id, "Job directory already exists, skipping id");
                    self.next_id = following;
                }
                Err(e) => {
                    tracing::error!(job_id = id, error = %e, "Failed to create job directory");
                    return Err(e.into());
                }
            }
        }
    }

    /// Remove the directory of a job that was not queued. Its id is reused
    /// unless the directory could not be removed.
    async fn discard_job_dir(&mut self, id: JobId, following: JobId, work_dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
            tracing::warn!(job_id = id, error = %e, "Failed to remove rejected job directory");
            self.next_id = following;
        }
    }

    /// Assign pending jobs to idle slots in FIFO order until either runs out.
    async fn dispatch(&mut self) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };

        let mut orphaned = Vec::new();
        while let Some((slot_id, job)) = self.slots.assign_next_job(&mut self.queue) {
            if let Err(job) = pool.assign(slot_id, job) {
                tracing::error!(job_id = job.id, slot_id, "Worker is not running");
                orphaned.push((slot_id, job.id));
            }
        }

        for (slot_id, job_id) in orphaned {
            self.slots.job_completed(slot_id, job_id);
            let outcome = JobOutcome::SpawnFailed {
                message: format!("worker slot {} is not running", slot_id),
            };
            self.finish_job(job_id, outcome).await;
        }
    }

    async fn on_worker_complete(&mut self, report: WorkerReport) {
        if !self.slots.job_completed(report.slot_id, report.job_id) {
            tracing::warn!(
                slot_id = report.slot_id,
                job_id = report.job_id,
                "Report does not match slot state"
            );
        }
        tracing::debug!(slot_id = report.slot_id, message = %report.message, "Worker report");
        self.finish_job(report.job_id, report.outcome).await;
        self.dispatch().await;
    }

    async fn finish_job(&mut self, job_id: JobId, outcome: JobOutcome) {
        let Some(job) = self.queue.complete(job_id, outcome) else {
            tracing::warn!(job_id, "Completion for a job that is not processing");
            return;
        };
        tracing::info!(job_id, outcome = ?job.outcome, "Job completed");
        if let Err(e) = job.write_marker().await {
            tracing::warn!(job_id, error = %e, "Failed to update marker");
        }
    }

    async fn status(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        for job in self
            .queue
            .pending_jobs()
            .into_iter()
            .chain(self.queue.processing_jobs())
        {
            snapshot.pending.insert(job.id, job.clone());
        }
        for job in self.queue.completed_jobs() {
            if tokio::fs::try_exists(&job.work_dir).await.unwrap_or(false) {
                snapshot.completed.insert(job.id, job.clone());
            }
        }
        snapshot
    }

    /// Remove a completed job and its working directory. Returns false if there
    /// was no such completed job.
    async fn delete_completed(&mut self, job_id: JobId) -> Result<bool> {
        let Some(job) = self.queue.remove_completed(job_id) else {
            if self.queue.get_job(job_id).is_some() {
                tracing::info!(job_id, "Job is still queued or running, not deleting");
            }
            return Ok(false);
        };

        match tokio::fs::remove_dir_all(&job.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(job_id, "Deleted completed job");
        Ok(true)
    }

    async fn drain(&mut self, mut report_rx: mpsc::UnboundedReceiver<WorkerReport>) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        tracing::info!(
            in_flight = self.queue.in_flight(),
            queued = self.queue.len(),
            "Dispatcher shutting down, waiting for running jobs"
        );

        let workers = tokio::spawn(pool.shutdown());
        while let Some(report) = report_rx.recv().await {
            self.slots.job_completed(report.slot_id, report.job_id);
            self.finish_job(report.job_id, report.outcome).await;
        }
        let _ = workers.await;

        if !self.queue.is_empty() {
            tracing::warn!(
                queued = self.queue.len(),
                "Queued jobs were not started before shutdown"
            );
        }
        tracing::info!("Dispatcher stopped");
    }
}

async fn prepare_job(id: JobId, work_dir: PathBuf, request: SubmitRequest) -> Result<JobRecord> {
    let SubmitRequest {
        template,
        tool,
        fields,
        uploads,
    } = request;

    let mut job = JobRecord::new(id, template, work_dir);
    job.tool = tool;

    for upload in uploads {
        if fields.contains_key(&upload.input) || job.inputs.contains_key(&upload.input) {
            return Err(DispatchError::InvalidInput {
                input: upload.input,
                reason: "given more than one value".to_string(),
            });
        }

        let name = sanitize_file_name(&upload.file_name)?;
        let dest = job.work_dir.join(name);
        if tokio::fs::try_exists(&dest).await? {
            return Err(DispatchError::InvalidInput {
                input: upload.input,
                reason: format!("file name {:?} is already used by another input", name),
            });
        }
        match &upload.source {
            UploadSource::Bytes(data) => tokio::fs::write(&dest, data).await?,
            UploadSource::Path(path) => {
                tokio::fs::copy(path, &dest).await?;
            }
        }

        let dest_str = dest.to_string_lossy().into_owned();
        job.input_file_timestamps
            .insert(dest_str.clone(), modified_at(&dest).await?);
        job.inputs.insert(upload.input, dest_str);
    }
    job.inputs.extend(fields);

    job.command = render_command(&job.template, &job.inputs)?;
    job.write_marker().await?;
    Ok(job)
}

/// Keep only the final component of an uploaded file name.
fn sanitize_file_name(name: &str) -> Result<&str> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DispatchError::InvalidFileName(name.to_string()))?;
    if base.starts_with("request_") {
        // Reserved for markers and result artifacts.
        return Err(DispatchError::InvalidFileName(name.to_string()));
    }
    Ok(base)
}

/// Cloneable front end of a running [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    message_tx: mpsc::Sender<DispatchMessage>,
    root: PathBuf,
    tools: Option<Arc<ServerConfig>>,
}

impl DispatcherHandle {
    /// Attach a tool catalog for [`submit_tool`](Self::submit_tool).
    pub fn with_tools(mut self, tools: ServerConfig) -> Self {
        self.tools = Some(Arc::new(tools));
        self
    }

    /// Absolute path of the job root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DispatchMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.message_tx
            .send(make(tx))
            .await
            .map_err(|_| DispatchError::ChannelClosed)?;
        rx.await.map_err(|_| DispatchError::ChannelClosed)
    }

    pub async fn submit(
        &self,
        template: impl Into<String>,
        fields: BTreeMap<String, String>,
        uploads: Vec<UploadedFile>,
    ) -> Result<JobId> {
        let request = SubmitRequest {
            template: template.into(),
            tool: None,
            fields,
            uploads,
        };
        self.request(|response_tx| DispatchMessage::Submit {
            request,
            response_tx,
        })
        .await?
    }

    /// Submit a catalogued tool by `family/title`, checking inputs against its declaration.
    pub async fn submit_tool(
        &self,
        tool_name: &str,
        fields: BTreeMap<String, String>,
        uploads: Vec<UploadedFile>,
    ) -> Result<JobId> {
        let tools = self
            .tools
            .as_ref()
            .ok_or_else(|| DispatchError::UnknownTool(tool_name.to_string()))?;
        let tool = tools.tool(tool_name)?;
        let upload_slots: BTreeSet<String> = uploads.iter().map(|u| u.input.clone()).collect();
        tool.check_inputs(&fields, &upload_slots)?;

        let request = SubmitRequest {
            template: tool.command.clone(),
            tool: Some(tool_name.to_string()),
            fields,
            uploads,
        };
        self.request(|response_tx| DispatchMessage::Submit {
            request,
            response_tx,
        })
        .await?
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.request(|response_tx| DispatchMessage::Status { response_tx })
            .await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.request(|response_tx| DispatchMessage::GetJob {
            job_id,
            response_tx,
        })
        .await
    }

    /// Contents of the job's stdout artifact, or its stderr artifact if the command failed.
    pub async fn fetch_result_text(&self, job_id: JobId) -> Result<String> {
        let job = match self.get_job(job_id).await? {
            Some(job) if job.status == JobStatus::Completed => job,
            _ => return Err(DispatchError::JobNotFound(job_id)),
        };

        for path in [job.stdout_path(), job.stderr_path()] {
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DispatchError::ResultMissing(job_id))
    }

    /// Delete a completed job and its directory. Unknown ids are ignored.
    pub async fn delete_completed(&self, job_id: JobId) -> Result<()> {
        self.request(|response_tx| DispatchMessage::DeleteCompleted {
            job_id,
            response_tx,
        })
        .await??;
        Ok(())
    }

    /// Poll until the job completes.
    pub async fn wait_for_completion(&self, job_id: JobId, poll: Duration) -> Result<JobRecord> {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            match self.get_job(job_id).await? {
                Some(job) if job.status == JobStatus::Completed => return Ok(job),
                Some(_) => continue,
                None => return Err(DispatchError::JobNotFound(job_id)),
            }
        }
    }

    /// Stop the dispatcher after running jobs finish. Queued jobs are not started.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response_tx| DispatchMessage::Shutdown { response_tx })
            .await
    }
}
