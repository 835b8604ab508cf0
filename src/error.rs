//! Error taxonomy shared by every operation surface.
//!
//! Callers (HTTP, CLI) map these variants onto their own status codes; the
//! library never formats transport-specific errors. `UpstreamUnavailable`
//! is the only retryable class.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed or out-of-range caller input. Not retryable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced entity does not exist (or is invisible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator (model provider, remote fetch) failed or timed out.
    /// Retryable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A bulk operation completed with some items failed.
    #[error("{failed} of {total} items failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::UpstreamUnavailable(msg.into())
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UpstreamUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}
