use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid command template: {0}")]
    InvalidTemplate(String),

    #[error("No value supplied for input {0}")]
    MissingInput(String),

    #[error("Invalid value for input {input}: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("Invalid upload file name: {0:?}")]
    InvalidFileName(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Job queue is at capacity ({0} pending jobs)")]
    QueueFull(usize),

    #[error("No job ids left under this job root")]
    IdsExhausted,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("No result artifact for job {0}")]
    ResultMissing(JobId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Marker error: {0}")]
    Marker(#[from] serde_json::Error),

    #[error("Dispatcher is not running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, DispatchError>;
