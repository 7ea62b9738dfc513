use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::assigner::SlotId;
use crate::scheduler::job::{JobId, JobOutcome, JobRecord};
use crate::worker::executor::JobExecutor;

/// Completion message a worker sends back to the dispatcher, once per job.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub slot_id: SlotId,
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub message: String,
}

/// Fixed set of long-lived workers, one per slot.
///
/// Each worker owns a single-job inbox. The dispatcher only hands a job to a
/// slot it has marked idle, so an inbox never holds more than one job.
pub struct WorkerPool {
    inboxes: Vec<mpsc::Sender<JobRecord>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        executor: JobExecutor,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        let mut inboxes = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for slot_id in 0..size {
            let (tx, rx) = mpsc::channel(1);
            let executor = executor.clone();
            let report_tx = report_tx.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(slot_id, rx, executor, report_tx).await;
            }));
            inboxes.push(tx);
        }

        tracing::info!(workers = size, "Worker pool started");
        Self { inboxes, handles }
    }

    /// Hand a job to the worker of `slot_id`. Gives the job back if that worker is gone.
    pub fn assign(&self, slot_id: SlotId, job: JobRecord) -> Result<(), JobRecord> {
        match self.inboxes.get(slot_id) {
            Some(inbox) => inbox.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => {
                    job
                }
            }),
            None => Err(job),
        }
    }

    /// Close every inbox and wait for the workers to finish their current job.
    pub async fn shutdown(self) {
        drop(self.inboxes);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    slot_id: SlotId,
    mut inbox: mpsc::Receiver<JobRecord>,
    executor: JobExecutor,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
) {
    while let Some(job) = inbox.recv().await {
        let result = executor.execute(&job).await;
        let report = WorkerReport {
            slot_id,
            job_id: job.id,
            message: result.message(),
            outcome: result.outcome,
        };
        if report_tx.send(report).is_err() {
            tracing::warn!(slot_id, job_id = job.id, "Dispatcher gone, worker exiting");
            break;
        }
    }
    tracing::debug!(slot_id, "Worker stopped");
}
