mod context;
mod exit_codes;
mod format;
#[cfg(test)]
mod tests;

pub use context::ErrorContext;
pub use exit_codes::get_exit_code;
pub use format::format_error_chain;

use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortlockError {
    #[error("Lock wait for '{path}' timed out after {waited_secs:.3}s")]
    LockTimeout {
        path: String,
        waited_secs: f64,
        details: String,
    },

    #[error("Failed to acquire lock on '{path}': {details}")]
    LockAcquire { path: String, details: String },

    #[error("Failed to release lock on '{path}': {details}")]
    LockRelease { path: String, details: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File name too long: {0}")]
    NameTooLong(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient disk space: {0}")]
    DiskSpaceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PortlockError {
    /// Maps an I/O failure observed while operating on `path` into the
    /// errno-shaped taxonomy surfaced to callers.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let location = path.display();
        match err.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                PortlockError::PermissionDenied(format!("{location}: {err}"))
            }
            io::ErrorKind::NotFound => PortlockError::NotFound(format!("{location}: {err}")),
            io::ErrorKind::StorageFull => {
                PortlockError::DiskSpaceError(format!("{location}: {err}"))
            }
            io::ErrorKind::InvalidFilename => {
                PortlockError::NameTooLong(format!("{location}: {err}"))
            }
            _ => PortlockError::Io(err),
        }
    }

    /// True when the error reports contention that outlived the caller's wait
    /// budget rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PortlockError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PortlockError>;
