//! The error type shared by every stage of a deployment.
use crate::job::WriteState;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required tool is missing or a requested filesystem is unsupported.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The job cannot run in the requested mode with the given source.
    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("refusing to erase {}: {reason}", device.display())]
    SafetyViolation { device: PathBuf, reason: String },

    #[error("{} is already in use by another job", .0.display())]
    DeviceBusy(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An external tool failed to launch or exited with a non-zero status.
    #[error("{program} failed: {reason}")]
    Process { program: String, reason: String },

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: WriteState, to: WriteState },
}

/// The coarse error categories callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    SafetyViolation,
    DeviceIo,
    Process,
    CancellationRequested,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::Precondition(_) | Error::InvalidTransition { .. } => {
                ErrorKind::Configuration
            }
            Error::SafetyViolation { .. } | Error::DeviceBusy(_) => ErrorKind::SafetyViolation,
            Error::Io { .. } => ErrorKind::DeviceIo,
            Error::Process { .. } => ErrorKind::Process,
            Error::Cancelled => ErrorKind::CancellationRequested,
        }
    }

    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn process(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Process {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn safety(device: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::SafetyViolation {
            device: device.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}
