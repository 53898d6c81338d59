use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{Completion, JobStore};
use crate::types::{ExecutionResult, Job, JobStatus, Language};

/// Redis layout - defines only key semantics so the API and worker never drift

pub const QUEUE_KEY: &str = "sandrun:queue";
pub const JOB_PREFIX: &str = "sandrun:job";

/// Interval between claim attempts while the queue is empty
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pops ids until it finds one still pending, marks it running and returns the id followed
/// by the record's fields, so a claimed job never needs a second round trip.
/// Ids whose record expired or was already started are discarded.
const CLAIM_SCRIPT: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local key = ARGV[1] .. ':' .. id
  if redis.call('HGET', key, 'status') == 'pending' then
    redis.call('HSET', key, 'status', 'running', 'started_at', ARGV[2])
    local reply = redis.call('HGETALL', key)
    table.insert(reply, 1, id)
    return reply
  end
end
"#;

/// Attaches a result only if the job is still running.
/// Returns 1 when applied, 0 when already terminal, -1 when the job does not exist,
/// -2 when the job has not been claimed.
const COMPLETE_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return -1
end
if status == 'pending' then
  return -2
end
if status ~= 'running' then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'result', ARGV[2], 'completed_at', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

/// Generate the hash key holding a job record
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Redis-backed store. Job records are hashes, the queue is a list of ids.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    /// Bound on every round trip so a hung Redis cannot block callers indefinitely
    op_timeout: Duration,
    ttl: Duration,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, op_timeout: Duration, ttl: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))??;
        Ok(Self::new(conn, op_timeout, ttl))
    }

    pub fn new(conn: ConnectionManager, op_timeout: Duration, ttl: Duration) -> Self {
        Self {
            conn,
            op_timeout,
            ttl,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }

    async fn try_claim(&self) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let started_at = Utc::now().to_rfc3339();
        let claimed: Option<Vec<String>> = self
            .bounded(async {
                Ok::<_, StoreError>(Script::new(CLAIM_SCRIPT)
                    .key(QUEUE_KEY)
                    .arg(JOB_PREFIX)
                    .arg(&started_at)
                    .invoke_async(&mut conn)
                    .await?)
            })
            .await?;

        let Some(reply) = claimed else {
            return Ok(None);
        };
        let job = claimed_job(reply)?;
        debug!(job_id = %job.id, "Claimed job");
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn submit(&self, code: String, language: Language) -> StoreResult<Uuid> {
        let job = Job::new(code, language);
        let key = job_key(&job.id);
        let mut conn = self.conn.clone();

        let fields = [
            ("code", job.code.clone()),
            ("language", job.language.to_string()),
            ("status", job.status.to_string()),
            ("submitted_at", job.submitted_at.to_rfc3339()),
        ];

        // Record and enqueue in one MULTI so a worker never pops an id without a record
        self.bounded(async {
            redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields)
                .ignore()
                .expire(&key, self.ttl.as_secs() as i64)
                .ignore()
                .rpush(QUEUE_KEY, job.id.to_string())
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok::<(), StoreError>(())
        })
        .await?;

        Ok(job.id)
    }

    async fn claim(&self, wait: Duration) -> StoreResult<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, id: Uuid, result: ExecutionResult) -> StoreResult<Completion> {
        let key = job_key(&id);
        let next = result.job_status();
        let payload = serde_json::to_string(&result)?;
        let completed_at = Utc::now().to_rfc3339();
        let mut conn = self.conn.clone();

        let outcome: i64 = self
            .bounded(async {
                Ok::<_, StoreError>(Script::new(COMPLETE_SCRIPT)
                    .key(&key)
                    .arg(next.as_str())
                    .arg(&payload)
                    .arg(&completed_at)
                    .arg(self.ttl.as_secs())
                    .invoke_async(&mut conn)
                    .await?)
            })
            .await?;

        match outcome {
            1 => Ok(Completion::Applied(next)),
            0 => {
                let current = self
                    .fetch(id)
                    .await?
                    .map(|job| job.status)
                    .unwrap_or(next);
                warn!(job_id = %id, status = %current, "Duplicate completion ignored");
                Ok(Completion::AlreadyTerminal(current))
            }
            -2 => Err(StoreError::InvalidTransition {
                id,
                from: JobStatus::Pending,
                to: next,
            }),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn fetch(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let key = job_key(&id);
        let fields: HashMap<String, String> = self
            .bounded(async { Ok::<_, StoreError>(conn.hgetall(&key).await?) })
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(id, &fields).map(Some)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok::<(), StoreError>(())
        })
        .await
    }
}

/// Parse a claim reply: the job id followed by its hash as field/value pairs
fn claimed_job(reply: Vec<String>) -> StoreResult<Job> {
    let mut items = reply.into_iter();
    let raw_id = items.next().unwrap_or_default();
    let id = Uuid::parse_str(&raw_id).map_err(|e| StoreError::Corrupt {
        id: raw_id.clone(),
        reason: e.to_string(),
    })?;

    let mut fields = HashMap::new();
    while let Some(name) = items.next() {
        let value = items.next().ok_or_else(|| StoreError::Corrupt {
            id: raw_id.clone(),
            reason: format!("field '{}' has no value", name),
        })?;
        fields.insert(name, value);
    }
    job_from_fields(id, &fields)
}

/// Rebuild a job from its hash fields
pub fn job_from_fields(id: Uuid, fields: &HashMap<String, String>) -> StoreResult<Job> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
    };
    let timestamp = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        match fields.get(name) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| corrupt(format!("bad {}: {}", name, e))),
            None => Ok(None),
        }
    };

    let language = Language::parse(field("language")?)
        .ok_or_else(|| corrupt(format!("unknown language '{}'", fields["language"])))?;
    let status = JobStatus::parse(field("status")?)
        .ok_or_else(|| corrupt(format!("unknown status '{}'", fields["status"])))?;
    let result = match fields.get("result") {
        Some(raw) => Some(serde_json::from_str::<ExecutionResult>(raw)?),
        None => None,
    };
    let submitted_at = timestamp("submitted_at")?
        .ok_or_else(|| corrupt("missing field 'submitted_at'".to_string()))?;

    Ok(Job {
        id,
        code: field("code")?.clone(),
        language,
        status,
        result,
        submitted_at,
        started_at: timestamp("started_at")?,
        completed_at: timestamp("completed_at")?,
    })
}
