/// Worker Pool
///
/// N interchangeable workers, each looping `claim -> execute -> complete` against a shared
/// job store. Workers hold no state between jobs; the pool size is the only bound on how
/// many executions hit the shared environments at once.
///
/// Shutdown is cooperative: a worker checks the shutdown flag between claims, so the job in
/// hand always runs to completion and gets recorded.
use sandrun_common::store::{Completion, JobStore};
use sandrun_common::types::{ExecutionResult, Job};
use sandrun_engine::CodeRunner;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// How long one claim waits for work before the shutdown flag is checked again
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(1);

const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_BACKOFF: Duration = Duration::from_millis(100);
const STORE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Counters shared by all workers of a pool
#[derive(Debug, Default)]
pub struct PoolStats {
    claimed: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicU64,
    record_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub in_flight: u64,
    pub record_failures: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            record_failures: self.record_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn CodeRunner>,
    workers: usize,
    claim_wait: Duration,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn CodeRunner>, workers: usize) -> Self {
        Self {
            store,
            runner,
            workers: workers.max(1),
            claim_wait: DEFAULT_CLAIM_WAIT,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    pub fn size(&self) -> usize {
        self.workers
    }

    /// Start every worker. Each handle resolves once its worker has seen the shutdown flag.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    store: self.store.clone(),
                    runner: self.runner.clone(),
                    claim_wait: self.claim_wait,
                    stats: self.stats.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn CodeRunner>,
    claim_wait: Duration,
    stats: Arc<PoolStats>,
}

impl Worker {
    #[instrument(skip(self, shutdown), fields(worker = self.id))]
    async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Worker started");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            match self.store.claim(self.claim_wait).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    tokio::time::sleep(STORE_ERROR_PAUSE).await;
                }
            }
        }

        info!("Worker stopped");
    }

    async fn process(&self, job: Job) {
        self.stats.claimed.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);

        info!(
            job_id = %job.id,
            language = %job.language,
            source_size = job.code.len(),
            "Received job"
        );

        let result = match self.runner.run_code(&job.code, job.language.as_str()).await {
            Ok(result) => result,
            Err(e) => {
                // The language may have been dropped from the registry since submission
                warn!(job_id = %job.id, error = %e, "Job rejected by dispatcher");
                ExecutionResult::rejected(e.failure_kind(), e.to_string())
            }
        };

        self.record(job.id, result).await;
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Attach the result, retrying while the store is unreachable
    async fn record(&self, job_id: Uuid, result: ExecutionResult) {
        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.store.complete(job_id, result.clone()).await {
                Ok(Completion::Applied(status)) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        job_id = %job_id,
                        status = %status,
                        execution_ms = result.duration_ms(),
                        environment = ?result.environment_used,
                        "Result recorded"
                    );
                    return;
                }
                Ok(Completion::AlreadyTerminal(status)) => {
                    warn!(job_id = %job_id, status = %status, "Job already terminal, result discarded");
                    return;
                }
                Err(e) if e.is_unavailable() && attempt < COMPLETE_ATTEMPTS => {
                    warn!(job_id = %job_id, attempt, error = %e, "Failed to record result, retrying");
                    tokio::time::sleep(COMPLETE_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => {
                    error!(job_id = %job_id, attempt, error = %e, "Failed to record result");
                    break;
                }
            }
        }
        self.stats.record_failures.fetch_add(1, Ordering::Relaxed);
    }
}
