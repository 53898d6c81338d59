use sandrun_common::types::FailureKind;
use thiserror::Error;

/// Reasons a request is refused before any environment is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unsupported language: {language}. Supported: {supported}")]
    UnsupportedLanguage { language: String, supported: String },

    #[error("Code and language are required")]
    EmptySource,

    #[error("Source code exceeds maximum size of {limit} bytes ({actual} bytes)")]
    SourceTooLarge { limit: usize, actual: usize },
}

impl DispatchError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::UnsupportedLanguage { .. } => FailureKind::UnsupportedLanguage,
            DispatchError::EmptySource | DispatchError::SourceTooLarge { .. } => FailureKind::InvalidRequest,
        }
    }
}

/// Failures talking to an environment, as opposed to failures of the submitted code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("Environment {environment} unreachable: {reason}")]
    Unreachable { environment: String, reason: String },

    #[error("Environment {environment} rejected {operation}: {reason}")]
    Rejected {
        environment: String,
        operation: &'static str,
        reason: String,
    },
}
