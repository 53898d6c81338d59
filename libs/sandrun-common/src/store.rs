//! Job store / queue abstraction.
//!
//! A store is an ordered work queue plus a keyed status table. Both implementations
//! guarantee that `claim` hands a job to exactly one caller and that `complete` applies
//! at most once per job.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::types::{ExecutionResult, Job, JobStatus, Language};

/// Outcome of a `complete` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The result was attached and the job is now terminal
    Applied(JobStatus),
    /// The job was already terminal; nothing changed
    AlreadyTerminal(JobStatus),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append a new pending job and return its id. Never executes anything.
    async fn submit(&self, code: String, language: Language) -> StoreResult<Uuid>;

    /// Wait up to `wait` for a pending job, atomically mark it running and return it
    async fn claim(&self, wait: Duration) -> StoreResult<Option<Job>>;

    /// Attach the result of a running job and move it to its terminal status
    async fn complete(&self, id: Uuid, result: ExecutionResult) -> StoreResult<Completion>;

    async fn fetch(&self, id: Uuid) -> StoreResult<Option<Job>>;

    /// Cheap reachability check
    async fn ping(&self) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    queue: VecDeque<Uuid>,
}

/// In-process store. Same contract as the Redis store, without durability.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    available: Notify,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave a job half-updated, so poisoning is ignored
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_claim(&self) -> Option<Job> {
        let mut state = self.lock();
        while let Some(id) = state.queue.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.start() {
                    return Some(job.clone());
                }
            }
        }
        None
    }

    /// Number of jobs waiting to be claimed
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn submit(&self, code: String, language: Language) -> StoreResult<Uuid> {
        let job = Job::new(code, language);
        let id = job.id;
        {
            let mut state = self.lock();
            state.jobs.insert(id, job);
            state.queue.push_back(id);
        }
        self.available.notify_one();
        Ok(id)
    }

    async fn claim(&self, wait: Duration) -> StoreResult<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a submit between the check and the wait is not lost
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_claim() {
                return Ok(Some(job));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_claim());
            }
        }
    }

    async fn complete(&self, id: Uuid, result: ExecutionResult) -> StoreResult<Completion> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if job.status.is_terminal() {
            return Ok(Completion::AlreadyTerminal(job.status));
        }

        let next = result.job_status();
        if !job.finish(result) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to: next,
            });
        }
        Ok(Completion::Applied(job.status))
    }

    async fn fetch(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn success() -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Success,
            output: Some("Hello from Python!".to_string()),
            error: None,
            exit_code: Some(0),
            failure: None,
            execution_time: 0.1,
            execution_id: Uuid::new_v4(),
            environment_used: Some("leetcodecompiler-python-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_submit_then_fetch_is_pending() {
        let store = MemoryJobStore::new();
        let id = store.submit("print(1)".to_string(), Language::Python).await.unwrap();

        let job = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.language, Language::Python);
        assert!(job.result.is_none());
        assert_eq!(store.queued(), 1);
    }

    #[tokio::test]
    async fn test_fetch_unknown_id() {
        let store = MemoryJobStore::new();
        assert!(store.fetch(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_marks_running() {
        let store = MemoryJobStore::new();
        let first = store.submit("a".to_string(), Language::Python).await.unwrap();
        let second = store.submit("b".to_string(), Language::Cpp).await.unwrap();

        let claimed = store.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(store.fetch(first).await.unwrap().unwrap().status, JobStatus::Running);

        let claimed = store.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);

        assert!(store.claim(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_wakes_on_submit() {
        let store = Arc::new(MemoryJobStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = store.submit("late".to_string(), Language::NodeJs).await.unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..50 {
            store.submit(format!("print({})", i), Language::Python).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = store.claim(Duration::from_millis(5)).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = MemoryJobStore::new();
        let id = store.submit("print(1)".to_string(), Language::Python).await.unwrap();
        store.claim(Duration::from_millis(10)).await.unwrap().unwrap();

        let first = store.complete(id, success()).await.unwrap();
        assert_eq!(first, Completion::Applied(JobStatus::Completed));

        let mut timeout = success();
        timeout.status = ExecutionStatus::Timeout;
        let second = store.complete(id, timeout).await.unwrap();
        assert_eq!(second, Completion::AlreadyTerminal(JobStatus::Completed));

        let job = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().output.as_deref(), Some("Hello from Python!"));
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let store = MemoryJobStore::new();
        let id = store.submit("print(1)".to_string(), Language::Python).await.unwrap();

        let err = store.complete(id, success()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: JobStatus::Pending, .. }));

        let err = store.complete(Uuid::new_v4(), success()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_polling_never_observes_regression() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.submit("print(1)".to_string(), Language::Python).await.unwrap();

        let poller = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut observed = Vec::new();
                for _ in 0..200 {
                    let job = store.fetch(id).await.unwrap().unwrap();
                    observed.push(job.status);
                    if job.status.is_terminal() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                observed
            })
        };

        tokio::task::yield_now().await;
        store.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::task::yield_now().await;
        store.complete(id, success()).await.unwrap();

        let observed = poller.await.unwrap();
        for pair in observed.windows(2) {
            assert!(
                pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
                "status regressed from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }
}
