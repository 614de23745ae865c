//! Error types for Boardlab.

use thiserror::Error;

/// Byte ceiling for failure comments stored on a job.
pub const FAILURE_COMMENT_MAX_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors: the submitted document is unusable.
    #[error("Invalid job definition: {0}")]
    Validation(String),

    // Errors blamed on the job content (bad test, bad commands).
    #[error("Job error: {0}")]
    Job(String),

    // Errors blamed on the lab (device, network, power).
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    // Coordination channel errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    // Infrastructure plumbing
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the lab, rather than the job content, is at fault.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Infrastructure(_)
                | Error::Configuration(_)
                | Error::Database(_)
                | Error::Channel(_)
                | Error::Io(_)
                | Error::Internal(_)
        )
    }

    /// Render this error as a failure comment, truncated to the storage
    /// ceiling on a character boundary.
    pub fn failure_comment(&self) -> String {
        let full = self.to_string();
        truncate_comment(&full)
    }
}

/// Truncate a comment to [`FAILURE_COMMENT_MAX_BYTES`], never splitting a
/// character.
pub fn truncate_comment(comment: &str) -> String {
    if comment.len() <= FAILURE_COMMENT_MAX_BYTES {
        return comment.to_string();
    }
    let mut end = FAILURE_COMMENT_MAX_BYTES;
    while !comment.is_char_boundary(end) {
        end -= 1;
    }
    comment[..end].to_string()
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
