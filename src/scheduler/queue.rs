use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;

use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobStatus};

const DEFAULT_MAX_PENDING: usize = 10_000;

/// Owns every job record and the FIFO order of the ones still waiting.
///
/// A record lives in exactly one of three places: `pending` (queued, in arrival
/// order), `processing` (handed to a worker) or `completed`.
#[derive(Debug)]
pub struct JobQueue {
    order: VecDeque<JobId>,
    pending: BTreeMap<JobId, JobRecord>,
    processing: BTreeMap<JobId, JobRecord>,
    completed: BTreeMap<JobId, JobRecord>,
    max_pending: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            order: VecDeque::new(),
            pending: BTreeMap::new(),
            processing: BTreeMap::new(),
            completed: BTreeMap::new(),
            max_pending,
        }
    }

    /// Append a job to the back of the queue. Returns false if the queue is at capacity.
    pub fn enqueue(&mut self, mut job: JobRecord) -> bool {
        if self.is_full() {
            return false;
        }
        job.status = JobStatus::Pending;
        self.order.push_back(job.id);
        self.pending.insert(job.id, job);
        true
    }

    /// Pop the oldest pending job and move it to the processing set.
    pub fn start_next(&mut self) -> Option<&JobRecord> {
        let id = self.order.pop_front()?;
        let mut job = self.pending.remove(&id)?;
        job.status = JobStatus::Processing;
        self.processing.insert(id, job);
        self.processing.get(&id)
    }

    /// Move a processing job to the completed table.
    pub fn complete(&mut self, id: JobId, outcome: JobOutcome) -> Option<&JobRecord> {
        let mut job = self.processing.remove(&id)?;
        job.status = JobStatus::Completed;
        job.outcome = Some(outcome);
        job.completed_at = Some(Utc::now());
        self.completed.insert(id, job);
        self.completed.get(&id)
    }

    /// Insert a job recovered from disk straight into the completed table.
    pub fn restore_completed(&mut self, mut job: JobRecord) {
        job.status = JobStatus::Completed;
        self.completed.insert(job.id, job);
    }

    pub fn remove_completed(&mut self, id: JobId) -> Option<JobRecord> {
        self.completed.remove(&id)
    }

    pub fn get_job(&self, id: JobId) -> Option<&JobRecord> {
        self.pending
            .get(&id)
            .or_else(|| self.processing.get(&id))
            .or_else(|| self.completed.get(&id))
    }

    pub fn get_completed(&self, id: JobId) -> Option<&JobRecord> {
        self.completed.get(&id)
    }

    /// Queued jobs in dispatch order.
    pub fn pending_jobs(&self) -> Vec<&JobRecord> {
        self.order
            .iter()
            .filter_map(|id| self.pending.get(id))
            .collect()
    }

    pub fn processing_jobs(&self) -> Vec<&JobRecord> {
        self.processing.values().collect()
    }

    pub fn completed_jobs(&self) -> Vec<&JobRecord> {
        self.completed.values().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.order.is_empty()
    }

    /// Number of jobs waiting to be dispatched
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.order.len() >= self.max_pending
    }

    pub fn in_flight(&self) -> usize {
        self.processing.len()
    }
}
