// Redis-backed bloom filter and dispatch queue.
//
// Run with a local server: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use timer_executor::app::{self, Backends};
use timer_executor::bloom::{BloomHasher, ProbabilisticSet, RedisBloomFilter};
use timer_executor::{Config, DispatchSource, RedisListSource, TaskKey};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connection() -> ConnectionManager {
    let client = redis::Client::open(redis_url()).unwrap();
    ConnectionManager::new(client).await.unwrap()
}

/// Key names unique to one test run.
fn scoped(name: &str) -> String {
    format!(
        "timer_executor_test:{name}:{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_bloom_marks_are_visible_and_expire() {
    let filter = RedisBloomFilter::connect(&redis_url(), BloomHasher::new(1 << 16, 4))
        .await
        .unwrap();
    let bucket = scoped(&TaskKey::new(42, 1_700_000_000_000).day_bucket());
    let item = TaskKey::new(42, 1_700_000_000_000).encode();

    assert!(!filter.exists(&bucket, &item).await.unwrap());

    filter
        .set(&bucket, &item, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(filter.exists(&bucket, &item).await.unwrap());
    assert!(!filter.exists(&bucket, "42_1700000001000").await.unwrap());

    let mut conn = connection().await;
    let ttl: i64 = conn.ttl(&bucket).await.unwrap();
    assert!((1..=60).contains(&ttl), "ttl {ttl}");

    let _: () = conn.del(&bucket).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_list_source_tracks_keys_until_acknowledged() {
    let queue = scoped("pending");
    let source = RedisListSource::connect(&redis_url(), queue.clone(), Duration::from_millis(20))
        .await
        .unwrap();
    let processing = source.processing_queue().to_string();
    let mut conn = connection().await;
    let _: () = conn.rpush(&queue, &["1_10", "2_20"]).await.unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(source.next(&cancel).await.unwrap().as_deref(), Some("1_10"));
    let in_flight: Vec<String> = conn.lrange(&processing, 0, -1).await.unwrap();
    assert_eq!(in_flight, vec!["1_10".to_string()]);

    // Requeued keys go to the back of the queue.
    source.requeue("1_10").await.unwrap();
    source.ack("1_10").await.unwrap();
    let in_flight: Vec<String> = conn.lrange(&processing, 0, -1).await.unwrap();
    assert!(in_flight.is_empty());

    assert_eq!(source.next(&cancel).await.unwrap().as_deref(), Some("2_20"));
    assert_eq!(source.next(&cancel).await.unwrap().as_deref(), Some("1_10"));

    // Neither was acknowledged, so a restart hands both back.
    assert_eq!(source.recover().await.unwrap(), 2);
    let pending: Vec<String> = conn.lrange(&queue, 0, -1).await.unwrap();
    assert_eq!(pending, vec!["2_20".to_string(), "1_10".to_string()]);

    let _: () = conn.del(&[&queue, &processing]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_list_source_returns_none_on_cancel_while_idle() {
    let queue = scoped("idle");
    let source = RedisListSource::connect(&redis_url(), queue.clone(), Duration::from_millis(20))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move { source.next(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next, None);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_connected_backends_run_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.redis.url = redis_url();
    config.redis.queue = scoped("wired");
    config.database.path = dir.path().join("timers.db").display().to_string();
    config.metrics.enabled = false;

    // Left over from a previous consumer; connect hands it back and the
    // run below works it (it has no task record, so it fails).
    let mut conn = connection().await;
    let processing = format!("{}:processing", config.redis.queue);
    let _: () = conn.rpush(&processing, "7_1700000000000").await.unwrap();

    let backends = Backends::connect(&config).await.unwrap();
    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        let config = config.clone();
        tokio::spawn(async move { app::run(&config, backends, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let stats = run.await.unwrap().unwrap();
    assert_eq!(stats.failed, 1);

    let _: () = conn.del(&[&config.redis.queue, &processing]).await.unwrap();
}
