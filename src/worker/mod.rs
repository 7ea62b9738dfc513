//! Job execution.
//!
//! - [`WorkerPool`]: fixed set of long-lived worker tasks, one per slot
//! - [`JobExecutor`]: runs one job's command and does its file bookkeeping
//!
//! # Execution Flow
//!
//! 1. The dispatcher hands a job to an idle slot's inbox
//! 2. [`JobExecutor::execute`] spawns `sh -c <command>` in the job's working directory
//! 3. Stdout (success) or stderr (failure) is written to the job's result artifact
//! 4. Inputs whose modification time did not change are deleted
//! 5. The worker sends a [`WorkerReport`] back to the dispatcher
//!
//! Commands run unsandboxed with the privileges of the dispatcher process.

pub mod executor;
pub mod pool;

pub use executor::{ExecutionResult, JobExecutor};
pub use pool::{WorkerPool, WorkerReport};
