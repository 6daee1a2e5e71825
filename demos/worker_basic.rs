use std::sync::Arc;

use oxbull::{async_trait, Handler, Job, Queue, QueueEvent, Worker, WorkerOptions};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

struct Mailer;

#[async_trait]
impl Handler<Email> for Mailer {
    async fn handle(&self, job: &Job<Email>) -> anyhow::Result<Option<serde_json::Value>> {
        println!("[worker] sending '{}' to {}", job.data.subject, job.data.to);
        Ok(Some(serde_json::json!({ "delivered": job.data.to })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue: Queue<Email> = Queue::new("emails", "redis://localhost:6379").await?;
    queue.on(|event| match event {
        QueueEvent::Completed { job, .. } => println!("[events] completed id={}", job.id),
        QueueEvent::Failed { job, error } => println!("[events] failed id={}: {}", job.id, error),
        QueueEvent::Empty => {}
        _ => {}
    });

    let worker = Arc::new(Worker::new(queue, Mailer, WorkerOptions::default()));
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    println!("[worker] draining 'emails', ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    worker.stop();
    runner.await??;
    Ok(())
}
