/// Submission paths
///
/// `QueuedSubmitter` records a pending job and returns its id; a worker executes it later.
/// `DirectSubmitter` executes inline and returns the result in the response.
///
/// The API picks one at startup from queue health. The queued submitter also carries a
/// direct one, used when the queue stops answering after startup and provably stored
/// nothing. If the queue may have stored the job, running it inline as well would execute
/// it twice, so the request fails with 503 instead. Every inline result is reported with
/// `mode: "direct"` so callers can tell the paths apart.
use async_trait::async_trait;
use sandrun_common::store::JobStore;
use sandrun_common::types::{ExecutionResult, Language};
use sandrun_engine::{CodeRunner, DispatchError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;

/// Where a submission ended up
#[derive(Debug, Clone)]
pub enum JobHandle {
    /// Enqueued; poll `/api/job/{id}` for the result
    Queued(Uuid),
    /// Executed synchronously
    Inline(ExecutionResult),
}

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Validate and submit. `Err` means nothing was run here: the request was refused, or
    /// the queue could not confirm it.
    async fn submit(&self, code: &str, language: &str) -> Result<JobHandle, ApiError>;

    fn mode(&self) -> &'static str;
}

pub struct DirectSubmitter {
    runner: Arc<dyn CodeRunner>,
}

impl DirectSubmitter {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }

    /// Execute inline and record latency
    pub async fn execute(&self, code: &str, language: &str) -> Result<ExecutionResult, DispatchError> {
        let started = Instant::now();
        let result = self.runner.run_code(code, language).await?;

        let language = Language::parse(language).map(|l| l.as_str()).unwrap_or("unknown");
        metrics::DIRECT_EXECUTION_SECONDS
            .with_label_values(&[language, result.status.as_str()])
            .observe(started.elapsed().as_secs_f64());
        Ok(result)
    }
}

#[async_trait]
impl Submitter for DirectSubmitter {
    async fn submit(&self, code: &str, language: &str) -> Result<JobHandle, ApiError> {
        let result = self.execute(code, language).await?;
        metrics::SUBMISSIONS.with_label_values(&["direct"]).inc();
        info!(
            execution_id = %result.execution_id,
            status = ?result.status,
            "Executed directly"
        );
        Ok(JobHandle::Inline(result))
    }

    fn mode(&self) -> &'static str {
        "direct"
    }
}

pub struct QueuedSubmitter {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn CodeRunner>,
    fallback: DirectSubmitter,
}

impl QueuedSubmitter {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn CodeRunner>) -> Self {
        Self {
            store,
            fallback: DirectSubmitter::new(runner.clone()),
            runner,
        }
    }
}

#[async_trait]
impl Submitter for QueuedSubmitter {
    async fn submit(&self, code: &str, language: &str) -> Result<JobHandle, ApiError> {
        // Refused requests are never enqueued
        let resolved = self.runner.validate(code, language)?;

        match self.store.submit(code.to_string(), resolved).await {
            Ok(job_id) => {
                metrics::SUBMISSIONS.with_label_values(&["queued"]).inc();
                info!(job_id = %job_id, language = %resolved, "Job queued");
                Ok(JobHandle::Queued(job_id))
            }
            Err(e) if e.may_have_applied() => {
                error!(
                    language = %resolved,
                    error = %e,
                    "Job queue did not confirm the submission; not executing it directly"
                );
                Err(ApiError::QueueUnavailable(e.to_string()))
            }
            Err(e) => {
                warn!(
                    language = %resolved,
                    error = %e,
                    "Job queue unavailable, executing directly"
                );
                metrics::QUEUE_FALLBACKS.inc();
                self.fallback.submit(code, language).await
            }
        }
    }

    fn mode(&self) -> &'static str {
        "queued"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_common::error::{StoreError, StoreResult};
    use sandrun_common::store::{Completion, MemoryJobStore};
    use sandrun_common::types::{ExecutionStatus, Job, JobStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CodeRunner for CountingRunner {
        fn validate(&self, code: &str, language: &str) -> Result<Language, DispatchError> {
            if code.trim().is_empty() {
                return Err(DispatchError::EmptySource);
            }
            Language::parse(language).ok_or_else(|| DispatchError::UnsupportedLanguage {
                language: language.to_string(),
                supported: "python, nodejs, cpp, java".to_string(),
            })
        }

        async fn run_code(&self, code: &str, language: &str) -> Result<ExecutionResult, DispatchError> {
            self.validate(code, language)?;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                status: ExecutionStatus::Success,
                output: Some("Hello from Python!".to_string()),
                error: None,
                exit_code: Some(0),
                failure: None,
                execution_time: 0.02,
                execution_id: Uuid::new_v4(),
                environment_used: Some("leetcodecompiler-python-1".to_string()),
            })
        }

        fn supported_languages(&self) -> Vec<&'static str> {
            vec!["python", "nodejs", "cpp", "java"]
        }
    }

    /// A queue whose every operation fails as if Redis were down
    struct DownStore;

    #[async_trait]
    impl JobStore for DownStore {
        async fn submit(&self, _code: String, _language: Language) -> StoreResult<Uuid> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn claim(&self, _wait: Duration) -> StoreResult<Option<Job>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn complete(&self, _id: Uuid, _result: ExecutionResult) -> StoreResult<Completion> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn fetch(&self, _id: Uuid) -> StoreResult<Option<Job>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_queued_submit_enqueues_without_running() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = Arc::new(CountingRunner::default());
        let submitter = QueuedSubmitter::new(store.clone(), runner.clone());

        let handle = submitter.submit("print('hi')", "py").await.unwrap();
        let JobHandle::Queued(id) = handle else {
            panic!("expected a queued job");
        };

        let job = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.language, Language::Python);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_requests_are_never_enqueued() {
        let store = Arc::new(MemoryJobStore::new());
        let submitter = QueuedSubmitter::new(store.clone(), Arc::new(CountingRunner::default()));

        let err = submitter.submit("print(1)", "cobol").await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected(DispatchError::UnsupportedLanguage { .. })));
        let err = submitter.submit("  ", "python").await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected(DispatchError::EmptySource)));

        assert_eq!(store.queued(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_queue_falls_back_to_direct() {
        let runner = Arc::new(CountingRunner::default());
        let queued = QueuedSubmitter::new(Arc::new(DownStore), runner.clone());
        let direct = DirectSubmitter::new(runner.clone());

        let JobHandle::Inline(fallback) = queued.submit("print('Hello from Python!')", "python").await.unwrap() else {
            panic!("expected an inline result");
        };
        let JobHandle::Inline(inline) = direct.submit("print('Hello from Python!')", "python").await.unwrap() else {
            panic!("expected an inline result");
        };

        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert_eq!(fallback.status, inline.status);
        assert_eq!(fallback.output, inline.output);
        assert_eq!(fallback.environment_used, inline.environment_used);
        assert_eq!(queued.mode(), "queued");
        assert_eq!(direct.mode(), "direct");
    }

    /// Stores the job, then loses the reply as a Redis timeout would
    struct CommitThenTimeout {
        inner: MemoryJobStore,
    }

    #[async_trait]
    impl JobStore for CommitThenTimeout {
        async fn submit(&self, code: String, language: Language) -> StoreResult<Uuid> {
            self.inner.submit(code, language).await?;
            Err(StoreError::Timeout(Duration::from_secs(60)))
        }
        async fn claim(&self, wait: Duration) -> StoreResult<Option<Job>> {
            self.inner.claim(wait).await
        }
        async fn complete(&self, id: Uuid, result: ExecutionResult) -> StoreResult<Completion> {
            self.inner.complete(id, result).await
        }
        async fn fetch(&self, id: Uuid) -> StoreResult<Option<Job>> {
            self.inner.fetch(id).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_submission_is_not_run_twice() {
        let store = Arc::new(CommitThenTimeout {
            inner: MemoryJobStore::new(),
        });
        let runner = Arc::new(CountingRunner::default());
        let submitter = QueuedSubmitter::new(store.clone(), runner.clone());

        let err = submitter.submit("print('once')", "python").await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);

        // The job is queued exactly once and nothing ran inline
        assert_eq!(store.inner.queued(), 1);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }
}
