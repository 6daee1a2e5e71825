//! The job record: a plain value combining a job's decoded fields with the
//! per-job Redis operations (lock, progress, moves between containers, remove,
//! retry). Jobs address Redis through a shared [`QueueCore`] handle, so they
//! stay cheap to clone and free of back-references to the queue facade.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use redis::{AsyncCommands, ToRedisArgs};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{OxbullError, Result};
use crate::events::QueueEvent;
use crate::options::JobOptions;
use crate::queue::QueueCore;

/// TTL of a job lock. A worker that goes silent for this long forfeits the job.
pub const LOCK_TTL_MS: u64 = 5_000;

/// Marker trait for payload types. Blanket-implemented; callers only need the
/// serde derives plus `Clone`.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

const DATA_FIELD: &str = "data";
const OPTS_FIELD: &str = "opts";
const PROGRESS_FIELD: &str = "progress";
const TIMESTAMP_FIELD: &str = "timestamp";
const DELAY_FIELD: &str = "delay";
const STACKTRACE_FIELD: &str = "stacktrace";

/// A field of the job hash. Access is always by name so that a peer
/// implementation reordering hash fields changes nothing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Field {
    Data,
    Opts,
    Progress,
    Timestamp,
    Delay,
    Stacktrace,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Data => DATA_FIELD,
            Field::Opts => OPTS_FIELD,
            Field::Progress => PROGRESS_FIELD,
            Field::Timestamp => TIMESTAMP_FIELD,
            Field::Delay => DELAY_FIELD,
            Field::Stacktrace => STACKTRACE_FIELD,
        }
    }
}

impl AsRef<str> for Field {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Field, ()> {
        match s {
            DATA_FIELD => Ok(Field::Data),
            OPTS_FIELD => Ok(Field::Opts),
            PROGRESS_FIELD => Ok(Field::Progress),
            TIMESTAMP_FIELD => Ok(Field::Timestamp),
            DELAY_FIELD => Ok(Field::Delay),
            STACKTRACE_FIELD => Ok(Field::Stacktrace),
            _ => Err(()),
        }
    }
}

impl ToRedisArgs for Field {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        self.name().write_redis_args(out)
    }
}

/// A single unit of work, identified by a queue-unique 64-bit id.
pub struct Job<T: Payload> {
    pub(crate) core: Arc<QueueCore<T>>,
    pub id: u64,
    pub data: T,
    pub opts: JobOptions,
    pub progress: u32,
    /// Creation time, unix ms.
    pub timestamp: i64,
    /// Milliseconds the job is deferred past `timestamp`. Absent, the string
    /// `"undefined"` and `0` all mean no delay.
    pub delay: Option<i64>,
    /// Rendered error chain from the most recent failure, if any.
    pub stacktrace: Option<String>,
}

impl<T: Payload> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            id: self.id,
            data: self.data.clone(),
            opts: self.opts.clone(),
            progress: self.progress,
            timestamp: self.timestamp,
            delay: self.delay,
            stacktrace: self.stacktrace.clone(),
        }
    }
}

impl<T: Payload> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Job")
            .field("queue", &self.core.keys.queue_name())
            .field("id", &self.id)
            .field("progress", &self.progress)
            .field("timestamp", &self.timestamp)
            .field("delay", &self.delay)
            .finish()
    }
}

impl<T: Payload> Job<T> {
    /// Serialize the payload and options and write the job hash. The caller is
    /// responsible for enrolling the id into a container afterwards.
    pub(crate) async fn create(
        core: Arc<QueueCore<T>>,
        id: u64,
        data: T,
        opts: JobOptions,
    ) -> Result<Self> {
        let timestamp = opts
            .timestamp_ms()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let delay = opts.delay_ms();

        let data_json = serde_json::to_string(&data)?;
        let opts_json = opts.to_json()?;

        let mut fields: Vec<(Field, String)> = vec![
            (Field::Data, data_json),
            (Field::Opts, opts_json),
            (Field::Progress, "0".to_string()),
            (Field::Timestamp, timestamp.to_string()),
        ];
        if let Some(delay) = delay {
            fields.push((Field::Delay, delay.to_string()));
        }

        let mut conn = core.conn.clone();
        let _: () = conn.hset_multiple(core.keys.job(id), &fields).await?;

        Ok(Self {
            core,
            id,
            data,
            opts,
            progress: 0,
            timestamp,
            delay,
            stacktrace: None,
        })
    }

    /// Load a job from its hash. Returns `Ok(None)` when the hash does not
    /// exist; a hash that exists but lacks a required field is a fatal
    /// deserialization error.
    pub(crate) async fn from_id(core: Arc<QueueCore<T>>, id: u64) -> Result<Option<Self>> {
        let mut conn = core.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(core.keys.job(id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let data: T = serde_json::from_str(required(&raw, Field::Data)?)?;
        let opts = JobOptions::from_json(required(&raw, Field::Opts)?)?;
        let progress = parse_number(required(&raw, Field::Progress)?, Field::Progress)? as u32;
        let timestamp = parse_number(required(&raw, Field::Timestamp)?, Field::Timestamp)?;
        let delay = match raw.get(Field::Delay.name()).map(String::as_str) {
            None | Some("") | Some("undefined") => None,
            Some(value) => {
                let parsed = parse_number(value, Field::Delay)?;
                (parsed > 0).then_some(parsed)
            }
        };
        let stacktrace = raw.get(Field::Stacktrace.name()).cloned();

        Ok(Some(Self {
            core,
            id,
            data,
            opts,
            progress,
            timestamp,
            delay,
            stacktrace,
        }))
    }

    /// Write a progress value to the hash and emit a Progress event.
    pub async fn report_progress(&mut self, progress: u32) -> Result<()> {
        let mut conn = self.core.conn.clone();
        let _: () = conn
            .hset(self.key(), Field::Progress, progress)
            .await?;
        self.progress = progress;
        self.core.events.emit(&QueueEvent::Progress {
            job: self.clone(),
            progress,
        });
        Ok(())
    }

    /// Acquire or refresh this job's lock.
    ///
    /// With `renew == false` the set is conditional (set-if-not-exists) and the
    /// return value says whether the caller now owns the lock. With
    /// `renew == true` the set is unconditional; the caller asserts ownership.
    pub async fn take_lock(&self, token: &str, renew: bool) -> Result<bool> {
        let mut conn = self.core.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.core.keys.lock(self.id))
            .arg(token)
            .arg("PX")
            .arg(LOCK_TTL_MS);
        if !renew {
            cmd.arg("NX");
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    /// Delete the lock iff it still holds `token`. Returns whether the delete
    /// took effect; `false` means the lock expired or was adopted by another
    /// worker in the meantime.
    pub async fn release_lock(&self, token: &str) -> Result<bool> {
        let mut conn = self.core.conn.clone();
        let deleted: i64 = self
            .core
            .scripts
            .release_lock
            .key(self.core.keys.lock(self.id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    /// Settle the job as completed: out of `active`, into the completed set.
    pub async fn move_to_completed(&self) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let (_, _): (i64, i64) = redis::pipe()
            .atomic()
            .lrem(keys.active(), 0, self.id)
            .sadd(keys.completed(), self.id)
            .query_async(&mut conn)
            .await?;
        debug!(job_id = self.id, "moved to completed");
        Ok(())
    }

    /// Settle the job as failed. The stacktrace lands on the hash before the
    /// move so an observer of the failed set never sees a job without one.
    pub async fn move_to_failed(&mut self, error: &str) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let _: () = conn.hset(self.key(), Field::Stacktrace, error).await?;
        let (_, _): (i64, i64) = redis::pipe()
            .atomic()
            .lrem(keys.active(), 0, self.id)
            .sadd(keys.failed(), self.id)
            .query_async(&mut conn)
            .await?;
        self.stacktrace = Some(error.to_string());
        debug!(job_id = self.id, "moved to failed");
        Ok(())
    }

    /// Schedule the job to run no earlier than `at_ms` (unix ms). Publishes the
    /// timestamp on the delayed channel so subscribed delay timers re-arm. Any
    /// stale copy in `active` is cleaned up by the delay-poll script at
    /// promotion time.
    pub async fn move_to_delayed(&self, at_ms: i64) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let score = at_ms.max(0);
        let (_, _): (i64, i64) = redis::pipe()
            .atomic()
            .zadd(keys.delayed(), self.id, score)
            .cmd("PUBLISH")
            .arg(keys.delayed_channel())
            .arg(score)
            .query_async(&mut conn)
            .await?;
        debug!(job_id = self.id, due_at = score, "moved to delayed");
        Ok(())
    }

    /// Delete the job everywhere. Pending containers are only touched when the
    /// job has not settled; the hash is deleted unconditionally.
    pub async fn remove(&self) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let _: i64 = self
            .core
            .scripts
            .remove_job
            .key(keys.wait())
            .key(keys.paused())
            .key(keys.active())
            .key(keys.delayed())
            .key(keys.completed())
            .key(keys.failed())
            .key(self.key())
            .arg(self.id)
            .invoke_async(&mut conn)
            .await?;
        debug!(job_id = self.id, "removed");
        Ok(())
    }

    /// Re-enqueue a failed job: out of the failed set, back onto `wait`
    /// honoring `lifo`, with a new-job notification. Requires at least one
    /// subscriber on the jobs channel, like `add`.
    pub async fn retry(&self) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let push = if self.opts.is_lifo() { "RPUSH" } else { "LPUSH" };
        let (_, _, receivers): (i64, i64, i64) = redis::pipe()
            .atomic()
            .srem(keys.failed(), self.id)
            .cmd(push)
            .arg(keys.wait())
            .arg(self.id)
            .cmd("PUBLISH")
            .arg(keys.jobs_channel())
            .arg(self.id)
            .query_async(&mut conn)
            .await?;
        if receivers < 1 {
            return Err(OxbullError::NoSubscribers);
        }
        debug!(job_id = self.id, "retried");
        Ok(())
    }

    fn key(&self) -> String {
        self.core.keys.job(self.id)
    }
}

fn required<'m>(raw: &'m HashMap<String, String>, field: Field) -> Result<&'m str> {
    raw.get(field.name())
        .map(String::as_str)
        .ok_or(OxbullError::MalformedField(field.name()))
}

/// Numeric hash fields are written as integers here, but a peer may write a
/// float rendering; accept both.
fn parse_number(raw: &str, field: Field) -> Result<i64> {
    raw.parse::<f64>()
        .map(|value| value as i64)
        .map_err(|_| OxbullError::MalformedField(field.name()))
}
