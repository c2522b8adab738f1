use thiserror::Error;

use crate::capture::CaptureError;
use crate::components::{ComponentStartError, ComponentStopErrors};
use crate::config::SettingsError;
use crate::logging::LoggingError;
use crate::provision::CommitError;

/// Unified result type for the session crate.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced at the session runtime boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("logging: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Start(#[from] ComponentStartError),
    #[error(transparent)]
    Stop(#[from] ComponentStopErrors),
    #[error("pointer capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("a provisioning pass is already running for this session")]
    ProvisionInFlight,
    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
