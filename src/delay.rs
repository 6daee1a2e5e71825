//! Single-wake scheduler for the earliest delayed job.
//!
//! Every process keeps one timer per queue. Messages on the delayed channel
//! carry a due timestamp; the timer only re-arms when the new timestamp is
//! earlier than the one it is already sleeping towards, so a burst of delayed
//! adds costs one outstanding sleep, not one per job. The wake itself runs the
//! delay-poll script and republishes the remaining minimum score, which is how
//! the timers of every subscribed worker converge without a coordinator.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error};

use crate::error::Result;
use crate::job::Payload;
use crate::queue::QueueCore;

pub(crate) struct DelayTimer<T: Payload> {
    core: Arc<QueueCore<T>>,
    state: Mutex<TimerState>,
}

struct TimerState {
    /// Unix ms of the armed wake; `i64::MAX` when idle.
    next_wake_at: i64,
    wake: Option<JoinHandle<()>>,
}

impl<T: Payload> DelayTimer<T> {
    pub fn new(core: Arc<QueueCore<T>>) -> Arc<Self> {
        Arc::new(Self {
            core,
            state: Mutex::new(TimerState {
                next_wake_at: i64::MAX,
                wake: None,
            }),
        })
    }

    /// Arm a wake at `at_ms` if it is earlier than the outstanding one. The
    /// state lock is only ever held briefly on the cooperative scheduler,
    /// never across an await.
    pub fn schedule(self: &Arc<Self>, at_ms: i64) {
        let at_ms = at_ms.max(0);
        let mut state = self.state.lock().unwrap();
        if at_ms >= state.next_wake_at {
            return;
        }
        if let Some(outstanding) = state.wake.take() {
            outstanding.abort();
        }
        state.next_wake_at = at_ms;
        debug!(queue = self.core.keys.queue_name(), due_at = at_ms, "delay timer armed");

        let timer = Arc::clone(self);
        state.wake = Some(tokio::spawn(async move {
            let wait = at_ms - Utc::now().timestamp_millis();
            if wait > 0 {
                sleep(Duration::from_millis(wait as u64)).await;
            }
            timer.wake(at_ms).await;
        }));
    }

    async fn wake(self: Arc<Self>, wake_at: i64) {
        let next = match self.promote(wake_at).await {
            Ok(next) => next,
            Err(error) => {
                error!(queue = self.core.keys.queue_name(), %error, "delay poll failed");
                None
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            // A newer schedule may have replaced this wake already; only reset
            // the state that still belongs to it. Dropping our own handle
            // detaches the running task.
            if state.next_wake_at == wake_at {
                state.next_wake_at = i64::MAX;
                state.wake.take();
            }
        }

        if let Some(next) = next {
            let mut conn = self.core.conn.clone();
            if let Err(error) = conn
                .publish::<_, _, i64>(self.core.keys.delayed_channel(), next)
                .await
            {
                error!(queue = self.core.keys.queue_name(), %error, "delayed re-arm publish failed");
            }
        }
    }

    /// Run the delay-poll script: promote the earliest due job (if any) back
    /// onto `wait` and report the minimum score still scheduled.
    async fn promote(&self, wake_at: i64) -> Result<Option<i64>> {
        let keys = &self.core.keys;
        let mut conn = self.core.conn.clone();
        let next: Option<i64> = self
            .core
            .scripts
            .promote_delayed
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.active())
            .arg(wake_at)
            .arg(keys.job_prefix())
            .arg(keys.jobs_channel())
            .invoke_async(&mut conn)
            .await?;
        Ok(next)
    }
}

impl<T: Payload> Drop for DelayTimer<T> {
    fn drop(&mut self) {
        if let Some(outstanding) = self.state.lock().unwrap().wake.take() {
            outstanding.abort();
        }
    }
}
