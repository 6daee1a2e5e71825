use oxbull::{JobOptions, Queue};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue: Queue<Email> = Queue::new("emails", "redis://localhost:6379").await?;

    for n in 1..=3 {
        let job = queue
            .add(
                Email {
                    to: format!("user{}@example.com", n),
                    subject: "welcome aboard".into(),
                },
                JobOptions::new(),
            )
            .await?;
        println!("[enqueue] queued email job id={}", job.id);
    }

    // A job the worker should only see in five seconds.
    let delayed = queue
        .add(
            Email {
                to: "late@example.com".into(),
                subject: "you are in no hurry".into(),
            },
            JobOptions::new().delay(5_000),
        )
        .await?;
    println!("[enqueue] queued delayed job id={}", delayed.id);

    println!("[enqueue] {} jobs pending", queue.count().await?);
    Ok(())
}
