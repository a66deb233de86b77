//! Error handling for the download queue

use thiserror::Error;

/// Convenience alias used throughout the library
pub type Result<T> = std::result::Result<T, QueueError>;

/// Raw OS error code for "no space left on device" on unix targets
const ENOSPC: i32 = 28;

/// Main error type for the download queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Transient network failure (timeouts, resets, 5xx)
    #[error("{0}")]
    Network(String),

    /// Transient storage failure
    #[error("{0}")]
    Io(String),

    /// The download volume is out of space. Halts the whole queue.
    #[error("disk full: {0}")]
    DiskFull(String),

    /// Requested content no longer exists at the source
    #[error("{0}")]
    NotFound(String),

    /// Malformed request or unsupported content format
    #[error("{0}")]
    Validation(String),

    /// The worker was told to abort
    #[error("download cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot {action} task {id} while it is {status}")]
    InvalidState {
        id: String,
        status: String,
        action: &'static str,
    },

    /// Another live process is running this queue
    #[error("queue is being run by process {0}; stop it first")]
    Busy(u32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Map an I/O error, singling out out-of-space conditions
    pub fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull || err.raw_os_error() == Some(ENOSPC) {
            QueueError::DiskFull(err.to_string())
        } else {
            QueueError::Io(err.to_string())
        }
    }

    /// Whether the failure may go away on its own and is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Network(_) | QueueError::Io(_))
    }

    /// Whether the failure affects every task rather than just the one that hit it
    pub fn is_queue_fatal(&self) -> bool {
        matches!(self, QueueError::DiskFull(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

impl From<reqwest::Error> for QueueError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 404 || status.as_u16() == 410 => {
                QueueError::NotFound(err.to_string())
            }
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                QueueError::Validation(err.to_string())
            }
            _ => QueueError::Network(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(QueueError::Network("reset".into()).is_retryable());
        assert!(QueueError::Io("short write".into()).is_retryable());
        assert!(!QueueError::NotFound("gone".into()).is_retryable());
        assert!(!QueueError::Validation("bad".into()).is_retryable());
        assert!(!QueueError::DiskFull("full".into()).is_retryable());
        assert!(!QueueError::Cancelled.is_retryable());
    }

    #[test]
    fn test_only_disk_full_is_queue_fatal() {
        assert!(QueueError::DiskFull("full".into()).is_queue_fatal());
        assert!(!QueueError::Io("x".into()).is_queue_fatal());
    }

    #[test]
    fn test_from_io_detects_out_of_space() {
        let err = QueueError::from_io(io::Error::from_raw_os_error(ENOSPC));
        assert!(matches!(err, QueueError::DiskFull(_)));

        let err = QueueError::from_io(io::Error::new(io::ErrorKind::StorageFull, "full"));
        assert!(matches!(err, QueueError::DiskFull(_)));

        let err = QueueError::from_io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, QueueError::Io(_)));
    }

    #[test]
    fn test_task_level_messages_are_verbatim() {
        let err = QueueError::NotFound("chapter 12 was removed".into());
        assert_eq!(err.to_string(), "chapter 12 was removed");
    }
}
