use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::UnknownLanguage;

/// Languages with an execution recipe. Closed set: adding a language means adding a variant
/// and a built-in recipe for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py", alias = "python3")]
    Python,
    #[serde(alias = "node", alias = "javascript", alias = "js")]
    NodeJs,
    #[serde(alias = "c++")]
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::NodeJs,
        Language::Cpp,
        Language::Java,
    ];

    /// Canonical lowercase identifier, used in config files and Redis records
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::NodeJs => "nodejs",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// Case-insensitive parse accepting the common aliases clients send
    pub fn parse(s: &str) -> Option<Language> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Language::Python),
            "nodejs" | "node" | "javascript" | "js" => Some(Language::NodeJs),
            "cpp" | "c++" => Some(Language::Cpp),
            "java" => Some(Language::Java),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::parse(s).ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

/// Lifecycle of a queued job.
///
/// `Pending -> Running -> {Completed | Failed | TimedOut}`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut)
    }

    /// Position in the lifecycle; a status may only move to a strictly later rank
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut => 2,
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "timed_out" => Some(JobStatus::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level outcome of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Error => "error",
        }
    }
}

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedLanguage,
    InvalidRequest,
    CompileFailure,
    RuntimeFailure,
    TimedOut,
    Infrastructure,
}

/// Result of a single compile + run, as returned inline or attached to a job.
///
/// `output` is `None` when the execution failed before producing any output, and
/// `Some("")` when the program ran and printed nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Wall-clock seconds
    pub execution_time: f64,
    pub execution_id: Uuid,
    pub environment_used: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn duration_ms(&self) -> u64 {
        (self.execution_time * 1000.0).round() as u64
    }

    /// Terminal job status this result moves a running job into
    pub fn job_status(&self) -> JobStatus {
        match self.status {
            ExecutionStatus::Success => JobStatus::Completed,
            ExecutionStatus::Timeout => JobStatus::TimedOut,
            ExecutionStatus::Failure | ExecutionStatus::Error => JobStatus::Failed,
        }
    }

    /// Result for a request that was refused before touching any environment
    pub fn rejected(kind: FailureKind, message: impl Into<String>) -> Self {
        let status = match kind {
            FailureKind::Infrastructure => ExecutionStatus::Error,
            FailureKind::TimedOut => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failure,
        };
        Self {
            status,
            output: None,
            error: Some(message.into()),
            exit_code: None,
            failure: Some(kind),
            execution_time: 0.0,
            execution_id: Uuid::new_v4(),
            environment_used: None,
        }
    }
}

/// A submitted (code, language) request and its tracked lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub status: JobStatus,
    pub result: Option<ExecutionResult>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(code: String, language: Language) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            language,
            status: JobStatus::Pending,
            result: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move `Pending -> Running`. Returns false if the job was not pending.
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Move `Running -> terminal` and attach the result. Returns false if the job was not running.
    pub fn finish(&mut self, result: ExecutionResult) -> bool {
        let next = result.job_status();
        if self.status != JobStatus::Running || !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        true
    }
}

/// What a poller sees for a job id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub language: Language,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        // Results are only exposed once the job is terminal
        let result = if job.status.is_terminal() { job.result } else { None };
        Self {
            job_id: job.id,
            language: job.language,
            status: job.status,
            result,
            submitted_at: job.submitted_at,
            completed_at: job.completed_at,
        }
    }
}
