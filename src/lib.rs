pub mod config;
pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherHandle, StatusSnapshot, UploadSource, UploadedFile};
pub use error::{DispatchError, Result};
