use std::path::PathBuf;

use tool_dispatch::scheduler::{
    JobOutcome, JobQueue, JobRecord, JobStatus, SlotState, SlotTable,
};

fn job(id: u64) -> JobRecord {
    let mut job = JobRecord::new(
        id,
        format!("echo {}", id),
        PathBuf::from(format!("/jobs/{}", id)),
    );
    job.command = job.template.clone();
    job
}

#[test]
fn test_job_creation() {
    let job = job(3);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.command, "echo 3");
    assert!(job.outcome.is_none());
    assert!(job.completed_at.is_none());
}

#[test]
fn test_queue_is_fifo() {
    let mut queue = JobQueue::new();
    for id in 0..3 {
        assert!(queue.enqueue(job(id)));
    }

    let order: Vec<u64> = queue.pending_jobs().iter().map(|j| j.id).collect();
    assert_eq!(order, vec![0, 1, 2]);

    assert_eq!(queue.start_next().map(|j| j.id), Some(0));
    assert_eq!(queue.start_next().map(|j| j.id), Some(1));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.in_flight(), 2);
}

#[test]
fn test_job_lives_in_exactly_one_table() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(0));
    assert_eq!(queue.get_job(0).unwrap().status, JobStatus::Pending);

    queue.start_next();
    assert_eq!(queue.get_job(0).unwrap().status, JobStatus::Processing);
    assert!(queue.pending_jobs().is_empty());
    assert_eq!(queue.processing_jobs().len(), 1);

    queue.complete(0, JobOutcome::Succeeded);
    let done = queue.get_job(0).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.outcome, Some(JobOutcome::Succeeded));
    assert!(done.completed_at.is_some());
    assert!(queue.processing_jobs().is_empty());
    assert_eq!(queue.completed_jobs().len(), 1);
}

#[test]
fn test_complete_requires_processing() {
    let mut queue = JobQueue::new();
    queue.enqueue(job(0));

    // Still pending: completion is refused and nothing moves.
    assert!(queue.complete(0, JobOutcome::Succeeded).is_none());
    assert_eq!(queue.get_job(0).unwrap().status, JobStatus::Pending);
    assert!(queue.complete(42, JobOutcome::Succeeded).is_none());
}

#[test]
fn test_queue_capacity() {
    let mut queue = JobQueue::with_capacity(2);
    assert!(queue.enqueue(job(0)));
    assert!(queue.enqueue(job(1)));
    assert!(queue.is_full());
    assert!(!queue.enqueue(job(2)));

    // Dispatching frees queue capacity.
    queue.start_next();
    assert!(queue.enqueue(job(2)));
}

#[test]
fn test_remove_completed() {
    let mut queue = JobQueue::new();
    queue.restore_completed(job(5));
    assert_eq!(queue.get_completed(5).unwrap().status, JobStatus::Completed);

    assert!(queue.remove_completed(5).is_some());
    assert!(queue.remove_completed(5).is_none());
    assert!(queue.get_job(5).is_none());
}

#[test]
fn test_assignment_is_fifo() {
    let mut queue = JobQueue::new();
    let mut slots = SlotTable::new(2);
    for id in 0..3 {
        queue.enqueue(job(id));
    }

    let (slot_a, first) = slots.assign_next_job(&mut queue).unwrap();
    let (slot_b, second) = slots.assign_next_job(&mut queue).unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(second.id, 1);
    assert_ne!(slot_a, slot_b);
    assert_eq!(first.status, JobStatus::Processing);

    // Pool exhausted: job 2 waits.
    assert!(slots.assign_next_job(&mut queue).is_none());
    assert_eq!(queue.get_job(2).unwrap().status, JobStatus::Pending);

    // Freeing either slot lets job 2 through next.
    assert!(slots.job_completed(slot_b, 1));
    queue.complete(1, JobOutcome::Succeeded);
    let (slot_c, third) = slots.assign_next_job(&mut queue).unwrap();
    assert_eq!(third.id, 2);
    assert_eq!(slot_c, slot_b);
    assert_eq!(slots.state(slot_c), Some(SlotState::Busy(2)));
}

#[test]
fn test_dispatch_without_idle_slot_changes_nothing() {
    let mut queue = JobQueue::new();
    let mut slots = SlotTable::new(1);
    queue.enqueue(job(0));
    queue.enqueue(job(1));
    slots.assign_next_job(&mut queue).unwrap();

    for _ in 0..3 {
        assert!(slots.assign_next_job(&mut queue).is_none());
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.in_flight(), 1);
    assert_eq!(slots.busy_count(), 1);
    assert_eq!(queue.get_job(1).unwrap().status, JobStatus::Pending);
}

#[test]
fn test_dispatch_without_pending_job_changes_nothing() {
    let mut queue = JobQueue::new();
    let mut slots = SlotTable::new(3);

    assert!(slots.assign_next_job(&mut queue).is_none());
    assert_eq!(slots.idle_slots(), vec![0, 1, 2]);
    assert!(queue.is_empty());
}

#[test]
fn test_slot_release_checks_job() {
    let mut queue = JobQueue::new();
    let mut slots = SlotTable::new(1);
    queue.enqueue(job(7));
    let (slot_id, _) = slots.assign_next_job(&mut queue).unwrap();

    assert!(!slots.job_completed(slot_id, 8));
    assert!(!slots.job_completed(5, 7));
    assert_eq!(slots.state(slot_id), Some(SlotState::Busy(7)));

    assert!(slots.job_completed(slot_id, 7));
    assert_eq!(slots.state(slot_id), Some(SlotState::Idle));
    assert!(!slots.job_completed(slot_id, 7));
}
