//! Nack and delayed-retry behavior against a local Redis.

mod fixtures;
use fixtures::*;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dvmq::Queue;
use dvmq::job::{JobOptions, JobStatus};
use dvmq::queue::QueueOptions;

const REDIS_URL: &str = "redis://127.0.0.1:6379/";

async fn cleanup_redis_keys(conn_manager: &redis::aio::ConnectionManager, queue_name: &str) {
    let mut conn = conn_manager.clone();
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("dvmq:{queue_name}:*"))
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    if !keys.is_empty() {
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_default();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nacked_job_is_retried_until_success() {
    let queue_name = format!("test_retry_{}", nanoid::nanoid!(6));

    let options = QueueOptions {
        polling_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let handler = FlakyHandler {
        succeed_on_attempt: 3,
        ..Default::default()
    };
    let processed = handler.processed.clone();

    let queue = Arc::new(
        Queue::<FlakyHandler>::new(REDIS_URL, &queue_name, Some(options), handler)
            .await
            .expect("Failed to create queue"),
    );
    cleanup_redis_keys(&queue.redis, &queue_name).await;

    queue
        .push(
            JobOptions::new(TestJobPayload {
                message: "eventually".to_string(),
            })
            .with_id("flaky_1"),
        )
        .await
        .expect("push failed");

    let handle = queue.work();

    let mut succeeded = false;
    for _ in 0..100 {
        if queue.count(JobStatus::Success).await.unwrap_or(0) == 1 {
            succeeded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.shutdown().await.expect("shutdown failed");

    assert!(succeeded, "job did not succeed after retries");
    assert_eq!(processed.load(Ordering::SeqCst), 3);

    cleanup_redis_keys(&queue.redis, &queue_name).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_push_stays_out_of_pending_until_due() {
    let queue_name = format!("test_delay_{}", nanoid::nanoid!(6));

    let queue = Arc::new(
        Queue::<EchoHandler>::new(REDIS_URL, &queue_name, None, EchoHandler::default())
            .await
            .expect("Failed to create queue"),
    );
    cleanup_redis_keys(&queue.redis, &queue_name).await;

    queue
        .push(
            JobOptions::new(TestJobPayload {
                message: "later".to_string(),
            })
            .with_id("delayed_1")
            .with_delay(Duration::from_secs(2)),
        )
        .await
        .expect("push failed");

    assert_eq!(queue.count(JobStatus::Pending).await.unwrap(), 0);
    assert_eq!(queue.count(JobStatus::Delayed).await.unwrap(), 1);

    let handle = queue.work();

    let mut succeeded = false;
    for _ in 0..100 {
        if queue.count(JobStatus::Success).await.unwrap_or(0) == 1 {
            succeeded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.shutdown().await.expect("shutdown failed");

    assert!(succeeded, "delayed job never ran");

    cleanup_redis_keys(&queue.redis, &queue_name).await;
}
