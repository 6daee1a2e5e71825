//! Integration tests.
//!
//! Requires Redis to be installed: each test starts and stops its own
//! `redis-server` on a free port, so tests are isolated and can run in
//! parallel.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use oxbull::{
    async_trait, Handler, Job, JobOptions, OxbullError, Queue, QueueEvent, Worker, WorkerOptions,
};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use support::{eventually, TestContext};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct TestData {
    order: u32,
    value: String,
}

fn payload(order: u32, value: &str) -> TestData {
    TestData {
        order,
        value: value.to_string(),
    }
}

/// Records which job ids it ran; always succeeds.
struct Recording {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Recording {
    fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

#[async_trait]
impl Handler<TestData> for Recording {
    async fn handle(&self, job: &Job<TestData>) -> anyhow::Result<Option<serde_json::Value>> {
        self.seen.lock().unwrap().push(job.id);
        Ok(Some(json!({ "echo": job.data.order })))
    }
}

/// Records the `order` field of payloads in arrival order.
struct ArrivalOrder {
    arrivals: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Handler<TestData> for ArrivalOrder {
    async fn handle(&self, job: &Job<TestData>) -> anyhow::Result<Option<serde_json::Value>> {
        self.arrivals.lock().unwrap().push(job.data.order);
        Ok(None)
    }
}

/// Fails on every odd invocation (the 1st, 3rd, ...).
struct FlakyOddCalls {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Handler<TestData> for FlakyOddCalls {
    async fn handle(&self, _job: &Job<TestData>) -> anyhow::Result<Option<serde_json::Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % 2 == 1 {
            anyhow::bail!("flaky failure on call {}", call);
        }
        Ok(None)
    }
}

fn spawn_worker<H: Handler<TestData>>(
    queue: Queue<TestData>,
    handler: H,
    options: WorkerOptions,
) -> (Arc<Worker<TestData, H>>, JoinHandle<oxbull::Result<()>>) {
    let worker = Arc::new(Worker::new(queue, handler, options));
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };
    (worker, runner)
}

/// Poll until the completed set reaches `expected` members.
async fn wait_for_completed(queue: &Queue<TestData>, expected: usize, timeout_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while queue.get_completed().await.unwrap().len() < expected {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {} jobs to complete", expected);
        }
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn fifo_jobs_process_exactly_once_across_workers() {
    let ctx = TestContext::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (w1, r1) = spawn_worker(
        Queue::new("fifo", &ctx.url()).await.unwrap(),
        Recording {
            seen: Arc::clone(&seen),
        },
        WorkerOptions::default(),
    );
    let (w2, r2) = spawn_worker(
        Queue::new("fifo", &ctx.url()).await.unwrap(),
        Recording {
            seen: Arc::clone(&seen),
        },
        WorkerOptions::default(),
    );

    let producer: Queue<TestData> = Queue::new("fifo", &ctx.url()).await.unwrap();
    for (order, value) in [(1, "a"), (2, "b"), (3, "c")] {
        producer.add(payload(order, value), JobOptions::new()).await.unwrap();
    }

    wait_for_completed(&producer, 3, 10_000).await;

    // Exactly one worker saw each job, in any interleaving.
    let mut ids = seen.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(producer.count().await.unwrap(), 0);

    w1.stop();
    w2.stop();
    r1.await.unwrap().unwrap();
    r2.await.unwrap().unwrap();
}

#[tokio::test]
async fn lifo_enqueue_right_pushes() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("lifo", &ctx.url()).await.unwrap();

    for n in 1..=7u32 {
        queue
            .add(payload(n, &format!("bert{}", n)), JobOptions::new().lifo())
            .await
            .unwrap();
    }

    let waiting: Vec<u64> = queue.get_waiting().await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(waiting, vec![1, 2, 3, 4, 5, 6, 7]);

    // Raw list order shows the right-push: the first add is at the head.
    let mut conn = ctx.connection().await;
    let raw: Vec<u64> = conn.lrange("bull:lifo:wait", 0, -1).await.unwrap();
    assert_eq!(raw, vec![1, 2, 3, 4, 5, 6, 7]);

    // And the claim side pops the most recent add first.
    let first: Option<u64> = redis::cmd("RPOPLPUSH")
        .arg("bull:lifo:wait")
        .arg("bull:lifo:active")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(first, Some(7));
}

#[tokio::test]
async fn get_waiting_reports_insertion_order() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("order", &ctx.url()).await.unwrap();

    for n in 1..=3u32 {
        queue.add(payload(n, "fifo"), JobOptions::new()).await.unwrap();
    }

    let waiting: Vec<u64> = queue.get_waiting().await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(waiting, vec![1, 2, 3]);

    // Left-push storage keeps the newest add at the head...
    let mut conn = ctx.connection().await;
    let raw: Vec<u64> = conn.lrange("bull:order:wait", 0, -1).await.unwrap();
    assert_eq!(raw, vec![3, 2, 1]);

    // ...and the right-pop claim yields first-in-first-out.
    let first: Option<u64> = redis::cmd("RPOPLPUSH")
        .arg("bull:order:wait")
        .arg("bull:order:active")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(first, Some(1));
}

#[tokio::test]
async fn delayed_jobs_arrive_in_delay_order() {
    let ctx = TestContext::new();
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let (worker, runner) = spawn_worker(
        Queue::new("delays", &ctx.url()).await.unwrap(),
        ArrivalOrder {
            arrivals: Arc::clone(&arrivals),
        },
        WorkerOptions {
            force_sequential: true,
            ..Default::default()
        },
    );

    let producer: Queue<TestData> = Queue::new("delays", &ctx.url()).await.unwrap();
    let delays: [(u64, u32); 10] = [
        (100, 1),
        (1100, 6),
        (1900, 10),
        (300, 2),
        (1700, 9),
        (900, 5),
        (500, 3),
        (1300, 7),
        (700, 4),
        (1500, 8),
    ];
    for (delay, order) in delays {
        producer
            .add(payload(order, "delayed"), JobOptions::new().delay(delay))
            .await
            .unwrap();
    }

    eventually(
        || arrivals.lock().unwrap().len() == 10,
        20_000,
        "all delayed jobs to run",
    )
    .await;
    assert_eq!(*arrivals.lock().unwrap(), (1..=10).collect::<Vec<u32>>());

    worker.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_job_retried_from_event_completes() {
    let ctx = TestContext::new();
    let calls = Arc::new(AtomicU32::new(0));
    let worker_queue: Queue<TestData> = Queue::new("retry", &ctx.url()).await.unwrap();

    let (failed_tx, mut failed_rx) = unbounded_channel();
    worker_queue.on(move |event| {
        if let QueueEvent::Failed { job, .. } = event {
            let _ = failed_tx.send(job.clone());
        }
    });

    let (worker, runner) = spawn_worker(
        worker_queue,
        FlakyOddCalls {
            calls: Arc::clone(&calls),
        },
        WorkerOptions::default(),
    );

    let producer: Queue<TestData> = Queue::new("retry", &ctx.url()).await.unwrap();
    let job = producer.add(payload(1, "retry me"), JobOptions::new()).await.unwrap();

    let failed = timeout(Duration::from_secs(10), failed_rx.recv())
        .await
        .expect("a Failed event")
        .expect("event channel open");
    assert_eq!(failed.id, job.id);
    assert!(failed.stacktrace.is_some());

    // The stacktrace was persisted to the hash before the move to failed.
    let stored = producer.get_job(job.id).await.unwrap().unwrap();
    assert!(stored.stacktrace.unwrap().contains("flaky failure"));

    failed.retry().await.unwrap();

    wait_for_completed(&producer, 1, 10_000).await;
    let completed = producer.get_completed().await.unwrap();
    assert!(completed.iter().any(|j| j.id == job.id));
    assert!(producer.get_failed().await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    worker.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn stalled_job_adopted_on_worker_start() {
    let ctx = TestContext::new();
    let producer: Queue<TestData> = Queue::new("stalled", &ctx.url()).await.unwrap();
    let job = producer
        .add(payload(1, "left behind"), JobOptions::new())
        .await
        .unwrap();

    // Simulate a consumer that died right after claiming: the id sits in
    // active with no lock taken.
    let mut conn = ctx.connection().await;
    let moved: Option<u64> = redis::cmd("RPOPLPUSH")
        .arg("bull:stalled:wait")
        .arg("bull:stalled:active")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(moved, Some(job.id));

    let worker_queue: Queue<TestData> = Queue::new("stalled", &ctx.url()).await.unwrap();
    let (completed_tx, mut completed_rx) = unbounded_channel();
    worker_queue.on(move |event| {
        if let QueueEvent::Completed { job, value } = event {
            let _ = completed_tx.send((job.id, value.clone()));
        }
    });

    let (recording, _seen) = Recording::new();
    let (worker, runner) = spawn_worker(worker_queue, recording, WorkerOptions::default());

    let (adopted, value) = timeout(Duration::from_secs(10), completed_rx.recv())
        .await
        .expect("a Completed event")
        .unwrap();
    assert_eq!(adopted, job.id);
    // The handler's return value rides in the event.
    assert_eq!(value, Some(json!({ "echo": 1 })));

    let active: Vec<u64> = conn.lrange("bull:stalled:active", 0, -1).await.unwrap();
    assert!(active.is_empty());

    worker.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn pause_resume_is_identity_on_wait_contents() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("toggle", &ctx.url()).await.unwrap();

    let (event_tx, mut event_rx) = unbounded_channel();
    queue.on(move |event| match event {
        QueueEvent::Paused => {
            let _ = event_tx.send("paused");
        }
        QueueEvent::Resumed => {
            let _ = event_tx.send("resumed");
        }
        _ => {}
    });

    for n in 1..=3u32 {
        queue.add(payload(n, "parked"), JobOptions::new()).await.unwrap();
    }

    let mut conn = ctx.connection().await;
    let before: Vec<u64> = conn.lrange("bull:toggle:wait", 0, -1).await.unwrap();
    assert_eq!(before.len(), 3);

    queue.pause().await.unwrap();
    assert!(conn.exists::<_, bool>("bull:toggle:meta-paused").await.unwrap());
    let wait_now: Vec<u64> = conn.lrange("bull:toggle:wait", 0, -1).await.unwrap();
    assert!(wait_now.is_empty());
    let parked: Vec<u64> = conn.lrange("bull:toggle:paused", 0, -1).await.unwrap();
    assert_eq!(parked, before);
    assert_eq!(queue.count().await.unwrap(), 3);

    queue.resume().await.unwrap();
    assert!(!conn.exists::<_, bool>("bull:toggle:meta-paused").await.unwrap());
    let after: Vec<u64> = conn.lrange("bull:toggle:wait", 0, -1).await.unwrap();
    assert_eq!(after, before);

    let first = timeout(Duration::from_secs(5), event_rx.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(5), event_rx.recv()).await.unwrap();
    assert_eq!(first, Some("paused"));
    assert_eq!(second, Some("resumed"));
}

#[tokio::test]
async fn paused_queue_defers_until_resume() {
    let ctx = TestContext::new();
    let producer: Queue<TestData> = Queue::new("gate", &ctx.url()).await.unwrap();
    for n in 1..=2u32 {
        producer.add(payload(n, "gated"), JobOptions::new()).await.unwrap();
    }
    producer.pause().await.unwrap();

    let (recording, _seen) = Recording::new();
    let (worker, runner) = spawn_worker(
        Queue::new("gate", &ctx.url()).await.unwrap(),
        recording,
        WorkerOptions::default(),
    );

    sleep(Duration::from_millis(500)).await;
    assert!(producer.get_completed().await.unwrap().is_empty());

    producer.resume().await.unwrap();
    wait_for_completed(&producer, 2, 10_000).await;

    worker.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn remove_clears_every_container_and_hash() {
    let ctx = TestContext::new();
    let producer: Queue<TestData> = Queue::new("rm", &ctx.url()).await.unwrap();
    let (recording, _seen) = Recording::new();
    let (worker, runner) = spawn_worker(
        Queue::new("rm", &ctx.url()).await.unwrap(),
        recording,
        WorkerOptions::default(),
    );

    let settled = producer.add(payload(1, "done soon"), JobOptions::new()).await.unwrap();
    wait_for_completed(&producer, 1, 10_000).await;
    worker.stop();
    runner.await.unwrap().unwrap();

    let mut conn = ctx.connection().await;

    // Settled job: hash and terminal membership both disappear.
    let job = producer.get_job(settled.id).await.unwrap().unwrap();
    job.remove().await.unwrap();
    assert!(!conn.exists::<_, bool>("bull:rm:1").await.unwrap());
    assert!(producer.get_completed().await.unwrap().is_empty());

    // Unsettled job: evicted from wait as well.
    let parked = producer.add(payload(2, "never ran"), JobOptions::new()).await.unwrap();
    parked.remove().await.unwrap();
    let waiting: Vec<u64> = conn.lrange("bull:rm:wait", 0, -1).await.unwrap();
    assert!(waiting.is_empty());
    assert!(!conn.exists::<_, bool>("bull:rm:2").await.unwrap());
    assert_eq!(producer.count().await.unwrap(), 0);
}

#[tokio::test]
async fn lock_renew_is_unconditional() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("locks", &ctx.url()).await.unwrap();
    let job = queue.add(payload(1, "contended"), JobOptions::new()).await.unwrap();

    // First acquisition is set-if-absent.
    assert!(job.take_lock("worker-a", false).await.unwrap());
    assert!(!job.take_lock("worker-b", false).await.unwrap());

    // A renewal asserts ownership unconditionally.
    assert!(job.take_lock("worker-b", true).await.unwrap());

    // Release is a compare-and-delete on the token.
    assert!(!job.release_lock("worker-a").await.unwrap());
    assert!(job.release_lock("worker-b").await.unwrap());

    // Gone means acquirable again.
    assert!(job.take_lock("worker-a", false).await.unwrap());
}

#[tokio::test]
async fn count_spans_wait_and_delayed() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("census", &ctx.url()).await.unwrap();

    queue.add(payload(1, "now"), JobOptions::new()).await.unwrap();
    queue.add(payload(2, "now"), JobOptions::new()).await.unwrap();
    queue
        .add(payload(3, "much later"), JobOptions::new().delay(60_000))
        .await
        .unwrap();

    assert_eq!(queue.count().await.unwrap(), 3);
    assert_eq!(queue.get_waiting().await.unwrap().len(), 2);
    let delayed = queue.get_delayed().await.unwrap();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].id, 3);
}

#[tokio::test]
async fn peer_enqueued_jobs_are_consumed() {
    let ctx = TestContext::new();
    let (recording, seen) = Recording::new();
    let worker_queue: Queue<TestData> = Queue::new("interop", &ctx.url()).await.unwrap();
    let probe = worker_queue.clone();
    let (worker, runner) = spawn_worker(worker_queue, recording, WorkerOptions::default());

    // A peer implementation writes the wire format directly: counter, hash
    // (fields in its own order), left-push, publish.
    let mut conn = ctx.connection().await;
    let now_ms = chrono::Utc::now().timestamp_millis();
    for n in 1..=100u32 {
        let id: u64 = conn.incr("bull:interop:id", 1u64).await.unwrap();
        let data = format!(r#"{{"order":{},"value":"payload-{}"}}"#, n, n);
        let _: () = conn
            .hset_multiple(
                format!("bull:interop:{}", id),
                &[
                    ("progress", "0".to_string()),
                    ("data", data),
                    ("timestamp", now_ms.to_string()),
                    ("opts", "{}".to_string()),
                ],
            )
            .await
            .unwrap();
        let _: i64 = conn.lpush("bull:interop:wait", id).await.unwrap();
        let _: i64 = conn.publish("bull:interop:jobs", id).await.unwrap();
    }

    wait_for_completed(&probe, 100, 30_000).await;
    assert_eq!(probe.count().await.unwrap(), 0);

    let mut ids = seen.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, (1..=100u64).collect::<Vec<u64>>());

    worker.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn progress_is_persisted_and_observed() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("progress", &ctx.url()).await.unwrap();

    let (progress_tx, mut progress_rx) = unbounded_channel();
    queue.on(move |event| {
        if let QueueEvent::Progress { progress, .. } = event {
            let _ = progress_tx.send(*progress);
        }
    });

    let mut job = queue.add(payload(1, "tracked"), JobOptions::new()).await.unwrap();
    job.report_progress(42).await.unwrap();

    assert_eq!(queue.get_job(job.id).await.unwrap().unwrap().progress, 42);
    assert_eq!(progress_rx.recv().await, Some(42));
}

#[tokio::test]
async fn malformed_job_hash_is_fatal() {
    let ctx = TestContext::new();
    let queue: Queue<TestData> = Queue::new("broken", &ctx.url()).await.unwrap();

    let mut conn = ctx.connection().await;
    let _: () = conn
        .hset("bull:broken:99", "data", r#"{"order":1,"value":"x"}"#)
        .await
        .unwrap();

    let err = queue.get_job(99).await.unwrap_err();
    assert!(matches!(err, OxbullError::MalformedField(_)));

    // An absent hash is not an error, just no job.
    assert!(queue.get_job(100).await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_job_promoted_after_producer_exit() {
    let ctx = TestContext::new();
    {
        let producer: Queue<TestData> = Queue::new("orphan", &ctx.url()).await.unwrap();
        producer
            .add(payload(1, "later"), JobOptions::new().delay(600))
            .await
            .unwrap();
        // Producer exits; its delay timer dies with it.
    }
    sleep(Duration::from_millis(100)).await;

    let (recording, _seen) = Recording::new();
    let (worker, runner) = spawn_worker(
        Queue::new("orphan", &ctx.url()).await.unwrap(),
        recording,
        WorkerOptions::default(),
    );

    wait_for_completed(worker.queue(), 1, 10_000).await;

    worker.stop();
    runner.await.unwrap().unwrap();
}
