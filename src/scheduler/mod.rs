pub mod assigner;
pub mod job;
pub mod queue;
pub mod recovery;
pub mod template;

pub use assigner::{SlotId, SlotState, SlotTable};
pub use job::{JobId, JobOutcome, JobRecord, JobStatus};
pub use queue::JobQueue;
