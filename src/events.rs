//! In-process event hub.
//!
//! Seven named event streams flow through a single typed enum. Delivery is
//! best-effort and synchronous: observers run on the emitting task, in
//! registration order, and are never persisted or forwarded to other
//! processes. A slow observer slows the emitter.

use std::sync::RwLock;

use crate::job::{Job, Payload};

/// A lifecycle event observed on a queue.
pub enum QueueEvent<T: Payload> {
    /// A handler returned successfully; `value` is whatever it returned.
    Completed {
        job: Job<T>,
        value: Option<serde_json::Value>,
    },
    /// A handler failed; `error` is the rendered error chain, as persisted to
    /// the job's `stacktrace` field.
    Failed { job: Job<T>, error: String },
    /// `Job::report_progress` was called.
    Progress { job: Job<T>, progress: u32 },
    /// The queue was paused (broadcast received on the paused channel).
    Paused,
    /// The queue was resumed.
    Resumed,
    /// A dispatch loop found `wait` empty.
    Empty,
    /// A new-job notification arrived on the jobs channel.
    NewJob { id: u64 },
}

type Observer<T> = Box<dyn Fn(&QueueEvent<T>) + Send + Sync>;

pub(crate) struct EventHub<T: Payload> {
    observers: RwLock<Vec<Observer<T>>>,
}

impl<T: Payload> EventHub<T> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn on(&self, observer: impl Fn(&QueueEvent<T>) + Send + Sync + 'static) {
        self.observers.write().unwrap().push(Box::new(observer));
    }

    pub fn emit(&self, event: &QueueEvent<T>) {
        for observer in self.observers.read().unwrap().iter() {
            observer(event);
        }
    }
}
