use std::sync::Arc;

use oxbull::{async_trait, Handler, Job, JobOptions, Queue, Worker, WorkerOptions};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
struct Reminder {
    user_id: String,
    message: String,
}

struct Notify;

#[async_trait]
impl Handler<Reminder> for Notify {
    async fn handle(&self, job: &Job<Reminder>) -> anyhow::Result<Option<serde_json::Value>> {
        println!(
            "[notify] user={} message='{}' (job {})",
            job.data.user_id, job.data.message, job.id
        );
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue: Queue<Reminder> = Queue::new("reminders", "redis://localhost:6379").await?;
    let worker = Arc::new(Worker::new(queue.clone(), Notify, WorkerOptions::default()));
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    for (seconds, message) in [(1u64, "first"), (3, "second"), (5, "third")] {
        let job = queue
            .add(
                Reminder {
                    user_id: "u123".into(),
                    message: message.into(),
                },
                JobOptions::new().delay(seconds * 1_000),
            )
            .await?;
        println!("[main] scheduled '{}' in {}s as job {}", message, seconds, job.id);
    }

    tokio::time::sleep(std::time::Duration::from_secs(7)).await;
    worker.stop();
    runner.await??;
    Ok(())
}
