//! The worker: stalled-job recovery on start, then the dispatch loop.
//!
//! Claiming is a single atomic `RPOPLPUSH wait -> active`; an empty pop parks
//! the loop on the new-job channel with a hard one-second timeout that doubles
//! as a poll fallback for missed notifications. Handler invocation is the only
//! catch-and-continue boundary in the crate; every coordination failure
//! propagates.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{OxbullError, Result};
use crate::events::QueueEvent;
use crate::job::{Job, Payload};
use crate::lock::LockRenewer;
use crate::queue::Queue;

/// How long an empty dispatch loop waits for a new-job notification before
/// polling again.
pub const NEW_JOB_WAIT_MS: u64 = 1_000;

/// User-supplied job handler.
///
/// The returned value (if any) rides in the Completed event. A returned error
/// settles the job as failed with the rendered error chain as its stacktrace;
/// the framework never retries on its own.
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync + 'static {
    async fn handle(&self, job: &Job<T>) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// When true, each job is awaited before the next fetch (one in-flight job
    /// per worker). When false, jobs are spawned as independent tasks and the
    /// aggregate in-flight count is the caller's concern.
    pub force_sequential: bool,
    /// How long `run` waits for spawned jobs to finish after `stop`.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            force_sequential: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// A queue consumer. Several workers, in any number of processes, may drain
/// the same queue; coordination happens entirely through Redis.
pub struct Worker<T: Payload, H: Handler<T>> {
    queue: Queue<T>,
    handler: Arc<H>,
    options: WorkerOptions,
    name: String,
    /// Token used for stalled-job adoption probes.
    token: String,
    shutdown: watch::Sender<bool>,
}

impl<T: Payload, H: Handler<T>> Worker<T, H> {
    pub fn new(queue: Queue<T>, handler: H, options: WorkerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            handler: Arc::new(handler),
            options,
            name: format!("worker-{}", Uuid::new_v4()),
            token: Uuid::new_v4().to_string(),
            shutdown,
        }
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask a running `run` call to wind down.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Recover stalled jobs, then dispatch until [`stop`](Self::stop).
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.name, queue = self.queue.name(), "worker starting");
        self.recover_stalled_jobs().await?;

        let mut jobs = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Reap finished jobs so the set does not grow without bound.
            while jobs.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.changed() => break,
                next = self.next_job() => {
                    if let Some(job) = next? {
                        if self.options.force_sequential {
                            Self::process(job, Arc::clone(&self.handler)).await?;
                        } else {
                            let handler = Arc::clone(&self.handler);
                            jobs.spawn(async move {
                                if let Err(error) = Self::process(job, handler).await {
                                    error!(%error, "job settlement failed");
                                }
                            });
                        }
                    }
                }
            }
        }

        info!(worker = %self.name, in_flight = jobs.len(), "worker stopping");
        let drained = timeout(self.options.shutdown_timeout, async {
            while jobs.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(worker = %self.name, "shutdown timeout reached, aborting in-flight jobs");
            jobs.abort_all();
        }
        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    /// One claim attempt. An empty `wait` emits the Empty event and parks on
    /// the new-job notification (with the poll-fallback timeout) before
    /// returning to the caller's loop.
    async fn next_job(&self) -> Result<Option<Job<T>>> {
        let core = self.queue.core();
        let mut conn = core.conn.clone();
        let popped: Option<u64> = redis::cmd("RPOPLPUSH")
            .arg(core.keys.wait())
            .arg(core.keys.active())
            .query_async(&mut conn)
            .await?;

        match popped {
            Some(id) => {
                let job = Job::from_id(Arc::clone(core), id)
                    .await?
                    .ok_or(OxbullError::JobNotFound(id))?;
                Ok(Some(job))
            }
            None => {
                core.events.emit(&QueueEvent::Empty);
                let _ = timeout(
                    Duration::from_millis(NEW_JOB_WAIT_MS),
                    self.queue.new_job_notified(),
                )
                .await;
                Ok(None)
            }
        }
    }

    /// Execute one claimed job and settle its outcome.
    #[instrument(skip_all, fields(job_id = job.id))]
    async fn process(mut job: Job<T>, handler: Arc<H>) -> Result<()> {
        // A delay-carrying job was enqueued onto wait by a peer; defer it
        // instead of running the handler.
        if let Some(delay) = job.delay {
            debug!(job_id = job.id, delay, "deferring delayed job");
            return job.move_to_delayed(job.timestamp + delay).await;
        }

        let token = Uuid::new_v4().to_string();
        let renewer = LockRenewer::start(job.clone(), token.clone());
        let outcome = handler.handle(&job).await;
        drop(renewer);

        let core = Arc::clone(&job.core);
        match outcome {
            Ok(value) => {
                job.move_to_completed().await?;
                if !job.release_lock(&token).await? {
                    warn!(job_id = job.id, "lock expired before completion settled");
                }
                info!(job_id = job.id, "job completed");
                core.events.emit(&QueueEvent::Completed { job, value });
            }
            Err(cause) => {
                let error = format!("{cause:?}");
                job.move_to_failed(&error).await?;
                if !job.release_lock(&token).await? {
                    warn!(job_id = job.id, "lock expired before failure settled");
                }
                warn!(job_id = job.id, error = %error, "job failed");
                core.events.emit(&QueueEvent::Failed { job, error });
            }
        }
        Ok(())
    }

    /// Adopt jobs a dead consumer left in `active`.
    ///
    /// A set-if-absent lock probe succeeds exactly when the previous owner's
    /// lock expired without settlement; anything already in the completed set
    /// is left alone and the probe lock is released.
    async fn recover_stalled_jobs(&self) -> Result<()> {
        let core = self.queue.core();
        let mut conn = core.conn.clone();
        let ids: Vec<u64> = conn.lrange(core.keys.active(), 0, -1).await?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(worker = %self.name, candidates = ids.len(), "checking active list for stalled jobs");

        for id in ids {
            let Some(job) = Job::from_id(Arc::clone(core), id).await? else {
                continue;
            };
            if !job.take_lock(&self.token, false).await? {
                continue; // live owner
            }
            let settled: bool = conn.sismember(core.keys.completed(), id).await?;
            if settled {
                let _ = job.release_lock(&self.token).await?;
                continue;
            }
            info!(worker = %self.name, job_id = id, "adopting stalled job");
            Self::process(job, Arc::clone(&self.handler)).await?;
        }
        Ok(())
    }
}
