use async_trait::async_trait;
use std::time::Duration;

use crate::error::EnvironmentError;

/// One command to run inside an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Rendered recipe template; contains no user-supplied text
    pub command: String,
    pub workdir: String,
    /// Where the environment records the process id so the run can be terminated
    pub pid_file: String,
    /// Upper bound the environment enforces on its side, in addition to the caller's timeout
    pub limit: Duration,
}

/// Captured streams and exit status of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the environment could not report one
    pub exit_code: Option<i64>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A pre-provisioned, long-lived execution context reachable by identifier.
///
/// Implementations do not own environments; they only issue operations against them.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Write `contents` to `path`, byte for byte
    async fn write_file(&self, environment_id: &str, path: &str, contents: &[u8]) -> Result<(), EnvironmentError>;

    async fn run(&self, environment_id: &str, invocation: &Invocation) -> Result<CommandOutput, EnvironmentError>;

    /// Kill whatever `invocation` started, if it is still running
    async fn terminate(&self, environment_id: &str, invocation: &Invocation) -> Result<(), EnvironmentError>;

    /// Remove files and directories, recursively; entries may contain `*` wildcards.
    /// Missing paths are not an error.
    async fn remove(&self, environment_id: &str, paths: &[String]) -> Result<(), EnvironmentError>;

    /// Check that the environment is reachable and ready to accept work
    async fn probe(&self, environment_id: &str) -> Result<(), EnvironmentError>;
}
