//! The queue façade and the shared core handle.
//!
//! A [`Queue`] is cheap to clone and safe to share: all state lives in Redis
//! or behind `Arc`s. Constructing one opens a command connection, subscribes a
//! dedicated pub/sub connection to the queue's three channels, and starts the
//! per-process delay timer. Producers and workers both go through this type;
//! it is the channel subscription made here that lets a peer's `add` observe
//! at least one listener on the new-job channel.

use std::sync::Arc;

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delay::DelayTimer;
use crate::error::{OxbullError, Result};
use crate::events::{EventHub, QueueEvent};
use crate::job::{Job, Payload};
use crate::keys::Keys;
use crate::options::JobOptions;
use crate::scripts::Scripts;

/// Narrow handle shared by the queue façade, its jobs, and the delay timer:
/// the Redis connections, the key namer, the script library and the event hub.
pub(crate) struct QueueCore<T: Payload> {
    pub client: Client,
    pub conn: MultiplexedConnection,
    pub keys: Keys,
    pub scripts: Scripts,
    pub events: EventHub<T>,
}

/// A named job queue backed by a Redis-compatible store.
pub struct Queue<T: Payload> {
    core: Arc<QueueCore<T>>,
    timer: Arc<DelayTimer<T>>,
    new_job: Arc<Notify>,
    _listener: Arc<ListenerGuard>,
}

impl<T: Payload> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            timer: Arc::clone(&self.timer),
            new_job: Arc::clone(&self.new_job),
            _listener: Arc::clone(&self._listener),
        }
    }
}

struct ListenerGuard(JoinHandle<()>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T: Payload> Queue<T> {
    /// Open a queue on the given Redis URL.
    pub async fn new(name: impl Into<String>, redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Self::with_client(name, client).await
    }

    /// Open a queue on an existing client.
    pub async fn with_client(name: impl Into<String>, client: Client) -> Result<Self> {
        let keys = Keys::new(name);
        let conn = client.get_multiplexed_async_connection().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(keys.jobs_channel()).await?;
        pubsub.subscribe(keys.delayed_channel()).await?;
        pubsub.subscribe(keys.paused_channel()).await?;

        let core = Arc::new(QueueCore {
            client,
            conn,
            keys,
            scripts: Scripts::new(),
            events: EventHub::new(),
        });
        let timer = DelayTimer::new(Arc::clone(&core));
        let new_job = Arc::new(Notify::new());

        let listener = tokio::spawn(channel_listener(
            pubsub,
            Arc::clone(&core),
            Arc::clone(&timer),
            Arc::clone(&new_job),
        ));

        let queue = Self {
            core,
            timer,
            new_job,
            _listener: Arc::new(ListenerGuard(listener)),
        };

        info!(queue = queue.name(), "queue opened");
        queue.republish_earliest_delayed().await?;
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        self.core.keys.queue_name()
    }

    /// Register an observer for this process's event streams.
    pub fn on(&self, observer: impl Fn(&QueueEvent<T>) + Send + Sync + 'static) {
        self.core.events.on(observer);
    }

    /// Create a job and enroll it.
    ///
    /// Allocates the next id, writes the job hash, then atomically enqueues
    /// and publishes. A job carrying a delay goes straight to the delayed
    /// sorted set; otherwise it lands on `wait` and the new-job publish must
    /// reach at least one subscriber, or there would be nobody to wake.
    pub async fn add(&self, data: T, opts: JobOptions) -> Result<Job<T>> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();

        let id: u64 = conn.incr(keys.id(), 1u64).await?;
        let job = Job::create(Arc::clone(&self.core), id, data, opts).await?;

        if let Some(delay) = job.delay {
            let due_at = (job.timestamp + delay).max(0);
            let (_, _): (i64, i64) = redis::pipe()
                .atomic()
                .zadd(keys.delayed(), id, due_at)
                .cmd("PUBLISH")
                .arg(keys.delayed_channel())
                .arg(due_at)
                .query_async(&mut conn)
                .await?;
            debug!(queue = self.name(), job_id = id, due_at, "job added (delayed)");
        } else {
            let push = if job.opts.is_lifo() { "RPUSH" } else { "LPUSH" };
            let (_, receivers): (i64, i64) = redis::pipe()
                .atomic()
                .cmd(push)
                .arg(keys.wait())
                .arg(id)
                .cmd("PUBLISH")
                .arg(keys.jobs_channel())
                .arg(id)
                .query_async(&mut conn)
                .await?;
            if receivers < 1 {
                return Err(OxbullError::NoSubscribers);
            }
            debug!(queue = self.name(), job_id = id, "job added");
        }

        Ok(job)
    }

    /// Move `wait` to `paused` and mark the queue paused, atomically with the
    /// broadcast.
    pub async fn pause(&self) -> Result<()> {
        self.toggle_paused("paused").await
    }

    /// Move `paused` back to `wait` (contents preserved) and clear the mark.
    pub async fn resume(&self) -> Result<()> {
        self.toggle_paused("resumed").await
    }

    async fn toggle_paused(&self, mode: &str) -> Result<()> {
        let keys = &self.core.keys;
        let (src, dst) = if mode == "paused" {
            (keys.wait(), keys.paused())
        } else {
            (keys.paused(), keys.wait())
        };
        let mut conn = self.core.conn.clone();
        let _: i64 = self
            .core
            .scripts
            .pause_resume
            .key(src)
            .key(dst)
            .key(keys.meta_paused())
            .key(keys.id())
            .arg(mode)
            .arg(keys.paused_channel())
            .arg(keys.jobs_channel())
            .invoke_async(&mut conn)
            .await?;
        info!(queue = self.name(), mode, "queue state toggled");
        Ok(())
    }

    /// Number of jobs still to run: whichever of `wait`/`paused` is populated
    /// (they are mutually empty) plus everything scheduled.
    pub async fn count(&self) -> Result<u64> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let (waiting, paused, delayed): (u64, u64, u64) = redis::pipe()
            .atomic()
            .llen(keys.wait())
            .llen(keys.paused())
            .zcard(keys.delayed())
            .query_async(&mut conn)
            .await?;
        Ok(waiting.max(paused) + delayed)
    }

    /// Drop all unsettled work: the wait/paused lists, the pause mark, the
    /// delayed set, and the hashes of every job drained from the lists.
    /// Terminal sets and their job hashes are untouched.
    pub async fn empty(&self) -> Result<()> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();

        let (waiting, parked, _): (Vec<u64>, Vec<u64>, i64) = redis::pipe()
            .atomic()
            .lrange(keys.wait(), 0, -1)
            .lrange(keys.paused(), 0, -1)
            .del(&[keys.wait(), keys.paused(), keys.meta_paused(), keys.delayed()][..])
            .query_async(&mut conn)
            .await?;

        let drained: Vec<String> = waiting
            .into_iter()
            .chain(parked)
            .map(|id| keys.job(id))
            .collect();
        if !drained.is_empty() {
            let _: i64 = conn.del(&drained[..]).await?;
        }
        info!(queue = self.name(), "queue emptied");
        Ok(())
    }

    /// Load a single job by id.
    pub async fn get_job(&self, id: u64) -> Result<Option<Job<T>>> {
        Job::from_id(Arc::clone(&self.core), id).await
    }

    /// Load a job and re-enqueue it from the failed set.
    pub async fn retry_job(&self, id: u64) -> Result<()> {
        match self.get_job(id).await? {
            Some(job) => job.retry().await,
            None => Err(OxbullError::JobNotFound(id)),
        }
    }

    /// Load a job and delete it everywhere.
    pub async fn remove_job(&self, id: u64) -> Result<()> {
        match self.get_job(id).await? {
            Some(job) => job.remove().await,
            None => Err(OxbullError::JobNotFound(id)),
        }
    }

    /// Jobs ready to run, in insertion order (ascending id), independent of
    /// whether they were enqueued FIFO or LIFO.
    pub async fn get_waiting(&self) -> Result<Vec<Job<T>>> {
        let mut conn = self.core.conn.clone();
        let mut ids: Vec<u64> = conn.lrange(self.core.keys.wait(), 0, -1).await?;
        ids.sort_unstable();
        self.fetch_jobs(ids).await
    }

    /// Jobs currently owned by some worker, in list order.
    pub async fn get_active(&self) -> Result<Vec<Job<T>>> {
        let mut conn = self.core.conn.clone();
        let ids: Vec<u64> = conn.lrange(self.core.keys.active(), 0, -1).await?;
        self.fetch_jobs(ids).await
    }

    /// Jobs that settled successfully.
    pub async fn get_completed(&self) -> Result<Vec<Job<T>>> {
        self.fetch_set(self.core.keys.completed()).await
    }

    /// Jobs that settled with a failure.
    pub async fn get_failed(&self) -> Result<Vec<Job<T>>> {
        self.fetch_set(self.core.keys.failed()).await
    }

    /// Scheduled jobs, earliest due first.
    pub async fn get_delayed(&self) -> Result<Vec<Job<T>>> {
        let mut conn = self.core.conn.clone();
        let ids: Vec<u64> = conn.zrange(self.core.keys.delayed(), 0, -1).await?;
        self.fetch_jobs(ids).await
    }

    async fn fetch_set(&self, key: String) -> Result<Vec<Job<T>>> {
        let mut conn = self.core.conn.clone();
        let mut ids: Vec<u64> = conn.smembers(key).await?;
        ids.sort_unstable();
        self.fetch_jobs(ids).await
    }

    async fn fetch_jobs(&self, ids: Vec<u64>) -> Result<Vec<Job<T>>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = Job::from_id(Arc::clone(&self.core), id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// A freshly opened process may find jobs already scheduled by producers
    /// that have since exited; nudge every subscribed timer once so the
    /// earliest of them gets a wake.
    async fn republish_earliest_delayed(&self) -> Result<()> {
        let mut conn = self.core.conn.clone();
        let head: Vec<(u64, i64)> = conn
            .zrange_withscores(self.core.keys.delayed(), 0, 0)
            .await?;
        if let Some((_, due_at)) = head.first() {
            let _: i64 = conn
                .publish(self.core.keys.delayed_channel(), *due_at)
                .await?;
        }
        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<QueueCore<T>> {
        &self.core
    }

    /// Wait until the next new-job notification (or a stored permit).
    pub(crate) async fn new_job_notified(&self) {
        self.new_job.notified().await;
    }
}

/// Drains the queue's pub/sub subscription and fans messages out to the local
/// event hub, the delay timer, and the dispatch-loop wakeup.
async fn channel_listener<T: Payload>(
    mut pubsub: redis::aio::PubSub,
    core: Arc<QueueCore<T>>,
    timer: Arc<DelayTimer<T>>,
    new_job: Arc<Notify>,
) {
    let jobs_channel = core.keys.jobs_channel();
    let delayed_channel = core.keys.delayed_channel();
    let paused_channel = core.keys.paused_channel();

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%channel, %error, "undecodable pub/sub payload");
                continue;
            }
        };

        if channel == jobs_channel {
            // Sentinel -1 probes subscriber count; it wakes the loop but is no job.
            if let Ok(id) = payload.parse::<i64>() {
                if id >= 0 {
                    core.events.emit(&QueueEvent::NewJob { id: id as u64 });
                }
            }
            new_job.notify_one();
        } else if channel == delayed_channel {
            if let Ok(due_at) = payload.parse::<f64>() {
                timer.schedule(due_at as i64);
            }
        } else if channel == paused_channel {
            match payload.as_str() {
                "paused" => core.events.emit(&QueueEvent::Paused),
                "resumed" => core.events.emit(&QueueEvent::Resumed),
                other => warn!(mode = other, "unknown pause broadcast"),
            }
        }
    }
    debug!(queue = core.keys.queue_name(), "channel listener stopped");
}
