//! Cooperative lock renewal for in-flight jobs.

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::job::{Job, Payload};

/// Interval between renewals, half the lock TTL.
pub const LOCK_RENEW_INTERVAL_MS: u64 = 2_500;

/// Keeps a job's lock alive while its handler runs.
///
/// The first renewal fires immediately (an unconditional set, which is also
/// how the initial acquisition happens on the dispatch path), then every
/// [`LOCK_RENEW_INTERVAL_MS`]. Dropping the renewer aborts the task at its
/// current await point, so no renewal issued after disposal can resurrect an
/// expired lock.
pub(crate) struct LockRenewer {
    task: JoinHandle<()>,
}

impl LockRenewer {
    pub fn start<T: Payload>(job: Job<T>, token: String) -> Self {
        let task = tokio::spawn(async move {
            let mut ticks = interval(Duration::from_millis(LOCK_RENEW_INTERVAL_MS));
            loop {
                ticks.tick().await;
                if let Err(error) = job.take_lock(&token, true).await {
                    warn!(job_id = job.id, %error, "lock renewal failed");
                }
            }
        });
        Self { task }
    }
}

impl Drop for LockRenewer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
