use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::types::JobStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job queue unavailable: {0}")]
    Unavailable(String),

    #[error("Job queue did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the store itself is unreachable, as opposed to a problem with one job.
    /// Callers use this to decide whether to fall back to direct execution.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
            }
            _ => false,
        }
    }

    /// True when the operation may have taken effect even though it reported failure:
    /// the request could have reached Redis before the reply was lost. A refused connection
    /// or an error reply means nothing was written.
    pub fn may_have_applied(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Redis(e) => {
                !e.is_connection_refusal() && (e.is_timeout() || e.is_connection_dropped() || e.is_io_error())
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_lost_replies_may_have_applied() {
        assert!(StoreError::Timeout(Duration::from_secs(60)).may_have_applied());
        let dropped = redis::RedisError::from(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(StoreError::Redis(dropped).may_have_applied());
    }

    #[test]
    fn test_refusals_never_applied() {
        let refused = redis::RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let refused = StoreError::Redis(refused);
        assert!(refused.is_unavailable());
        assert!(!refused.may_have_applied());

        let reply = redis::RedisError::from((redis::ErrorKind::ResponseError, "OOM command not allowed"));
        assert!(!StoreError::Redis(reply).may_have_applied());
        assert!(!StoreError::Unavailable("connection refused".to_string()).may_have_applied());
    }
}
