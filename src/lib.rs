//! oxbull: a Redis-backed distributed job queue for Rust.
//!
//! Wire-compatible with the Node.js `bull` queue: producers written against
//! either library can be drained by workers using the other. Redis is the sole
//! persistence and coordination substrate; workers on any number of hosts
//! cooperate through atomic list moves, expiring locks, server-side Lua
//! scripts and pub/sub wakeups.
//!
//! ```no_run
//! use oxbull::{async_trait, Handler, Job, JobOptions, Queue, Worker, WorkerOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Thumbnail {
//!     video: String,
//! }
//!
//! struct Renderer;
//!
//! #[async_trait]
//! impl Handler<Thumbnail> for Renderer {
//!     async fn handle(&self, job: &Job<Thumbnail>) -> anyhow::Result<Option<serde_json::Value>> {
//!         println!("rendering {}", job.data.video);
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = Queue::new("video", "redis://127.0.0.1:6379").await?;
//!     queue.add(Thumbnail { video: "intro.mp4".into() }, JobOptions::new()).await?;
//!
//!     let worker = Worker::new(queue, Renderer, WorkerOptions::default());
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```

mod delay;
mod lock;
mod scripts;

pub mod error;
pub mod events;
pub mod job;
pub mod keys;
pub mod options;
pub mod queue;
pub mod worker;

pub use error::{OxbullError, Result};
pub use events::QueueEvent;
pub use job::{Field, Job, Payload, LOCK_TTL_MS};
pub use keys::Keys;
pub use lock::LOCK_RENEW_INTERVAL_MS;
pub use options::JobOptions;
pub use queue::Queue;
pub use worker::{Handler, Worker, WorkerOptions, NEW_JOB_WAIT_MS};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
