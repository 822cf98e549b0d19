//! Work item delivery.
//!
//! A [`DispatchSource`] yields work item keys at least once. The
//! [`Dispatcher`] runs one [`Worker::work`] task per key, bounded by a
//! semaphore, and optionally hands retryable failures back to the source
//! after a growing delay until the key runs out of attempts. Work cut short
//! by shutdown is always handed back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::worker::{WorkOutcome, Worker};

/// Source of work item keys.
#[async_trait]
pub trait DispatchSource: Send + Sync {
    /// Wait for the next key.
    ///
    /// `None` means the source is closed for good, or `cancel` fired before a
    /// key was taken. A key is never consumed and then dropped on cancel.
    async fn next(&self, cancel: &CancellationToken) -> ExecutorResult<Option<String>>;

    /// Hand `key` back for redelivery.
    async fn requeue(&self, key: &str) -> ExecutorResult<()>;

    /// Release a key returned by `next` once it needs no further delivery
    /// from this consumer.
    async fn ack(&self, _key: &str) -> ExecutorResult<()> {
        Ok(())
    }
}

/// Redis list consumed with `LMOVE` into a processing list.
///
/// Keys stay in `{queue}:processing` until acknowledged, so a consumer that
/// dies mid-item leaves them behind for [`RedisListSource::recover`].
#[derive(Clone)]
pub struct RedisListSource {
    conn: ConnectionManager,
    queue: String,
    processing: String,
    poll_interval: Duration,
}

impl RedisListSource {
    pub async fn connect(
        redis_url: &str,
        queue: impl Into<String>,
        poll_interval: Duration,
    ) -> ExecutorResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, queue, poll_interval))
    }

    pub fn new(conn: ConnectionManager, queue: impl Into<String>, poll_interval: Duration) -> Self {
        let queue = queue.into();
        Self {
            conn,
            processing: format!("{queue}:processing"),
            queue,
            poll_interval,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn processing_queue(&self) -> &str {
        &self.processing
    }

    /// Move every unacknowledged key back to the head of the queue.
    ///
    /// Run before dispatching starts. Keys still owned by another live
    /// consumer are delivered twice; the dedup gate absorbs that.
    pub async fn recover(&self) -> ExecutorResult<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let key: Option<String> = conn
                .lmove(&self.processing, &self.queue, Direction::Right, Direction::Left)
                .await?;
            if key.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(queue = %self.queue, moved, "Recovered unacknowledged work items");
        }
        Ok(moved)
    }
}

impl std::fmt::Debug for RedisListSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisListSource")
            .field("queue", &self.queue)
            .field("processing", &self.processing)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchSource for RedisListSource {
    async fn next(&self, cancel: &CancellationToken) -> ExecutorResult<Option<String>> {
        let mut conn = self.conn.clone();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            // The move itself is never raced against `cancel`.
            let key: Option<String> = conn
                .lmove(&self.queue, &self.processing, Direction::Left, Direction::Right)
                .await?;
            if let Some(key) = key {
                return Ok(Some(key));
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn requeue(&self, key: &str) -> ExecutorResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.queue, key).await?;
        Ok(())
    }

    async fn ack(&self, key: &str) -> ExecutorResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(&self.processing, 1, key).await?;
        Ok(())
    }
}

/// In-process source fed through an mpsc channel.
///
/// The source closes once every external sender is dropped; requeues made
/// after that point fail.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<String>>,
    requeue_tx: mpsc::WeakSender<String>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            rx: Mutex::new(rx),
            requeue_tx: tx.downgrade(),
        };
        (source, tx)
    }
}

#[async_trait]
impl DispatchSource for ChannelSource {
    async fn next(&self, cancel: &CancellationToken) -> ExecutorResult<Option<String>> {
        let mut rx = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            rx = self.rx.lock() => rx,
        };
        // `recv` is cancel safe: an abandoned receive leaves the key queued.
        Ok(tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            key = rx.recv() => key,
        })
    }

    async fn requeue(&self, key: &str) -> ExecutorResult<()> {
        let tx = self
            .requeue_tx
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("dispatch channel closed"))?;
        // Never wait here: every permit may be held by a requeueing task.
        tx.try_send(key.to_string())
            .map_err(|e| anyhow::anyhow!("failed to requeue onto dispatch channel: {e}"))?;
        Ok(())
    }
}

/// Totals for one [`Dispatcher::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub executed: u64,
    pub duplicates: u64,
    pub disabled: u64,
    pub failed: u64,
    pub requeued: u64,
    /// Keys dropped after exhausting their attempts.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
    duplicates: AtomicU64,
    disabled: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            executed: self.executed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            disabled: self.disabled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Failed attempts per key within one run.
#[derive(Debug, Default)]
struct Attempts(parking_lot::Mutex<HashMap<String, u32>>);

impl Attempts {
    fn record(&self, key: &str) -> u32 {
        let mut attempts = self.0.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, key: &str) {
        self.0.lock().remove(key);
    }
}

const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
struct RequeuePolicy {
    enabled: bool,
    delay: Duration,
    max_attempts: u32,
}

/// Pulls keys from a source and runs a bounded number of workers.
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn DispatchSource>,
    worker: Worker,
    concurrency: usize,
    requeue: RequeuePolicy,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn DispatchSource>, worker: Worker, concurrency: usize) -> Self {
        Self {
            source,
            worker,
            concurrency: concurrency.max(1),
            requeue: RequeuePolicy {
                enabled: true,
                delay: DEFAULT_REQUEUE_DELAY,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            },
        }
    }

    #[must_use]
    pub fn with_requeue_on_error(mut self, enabled: bool) -> Self {
        self.requeue.enabled = enabled;
        self
    }

    /// Wait `delay * attempt` before requeueing a failed key, and drop it
    /// once it has failed `max_attempts` times.
    #[must_use]
    pub fn with_requeue_policy(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.requeue.delay = delay;
        self.requeue.max_attempts = max_attempts.max(1);
        self
    }

    /// Dispatch until `cancel` fires or the source closes, then wait for
    /// in-flight work.
    pub async fn run(&self, cancel: CancellationToken) -> ExecutorResult<DispatchStats> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let counters = Arc::new(Counters::default());
        let attempts = Arc::new(Attempts::default());
        let mut tasks = JoinSet::new();

        info!(concurrency = self.concurrency, "Dispatcher started");

        loop {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| anyhow::anyhow!("dispatch semaphore closed: {e}"))?
                }
            };

            let key = match self.source.next(&cancel).await {
                Ok(Some(key)) if cancel.is_cancelled() => {
                    self.hand_back(&counters, &key).await;
                    break;
                }
                Ok(Some(key)) => key,
                Ok(None) if cancel.is_cancelled() => break,
                Ok(None) => {
                    info!("Dispatch source closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch work item");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(SOURCE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let worker = self.worker.clone();
            let source = Arc::clone(&self.source);
            let counters = Arc::clone(&counters);
            let attempts = Arc::clone(&attempts);
            let cancel = cancel.clone();
            let policy = self.requeue;

            tasks.spawn(async move {
                let result = worker.work(&cancel, &key).await;
                // The requeue delay must not hold a worker slot.
                drop(permit);

                let settled = match result {
                    Ok(outcome) => {
                        attempts.forget(&key);
                        let counter = match outcome {
                            WorkOutcome::Executed { .. } => &counters.executed,
                            WorkOutcome::Duplicate => &counters.duplicates,
                            WorkOutcome::Disabled => &counters.disabled,
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        handle_failure(
                            source.as_ref(),
                            &counters,
                            &attempts,
                            policy,
                            &cancel,
                            &key,
                            &e,
                        )
                        .await
                    }
                };

                if settled {
                    if let Err(e) = source.ack(&key).await {
                        warn!(key = %key, error = %e, "Failed to acknowledge work item");
                    }
                }
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Work task panicked");
                }
            }
        }

        debug!(in_flight = tasks.len(), "Waiting for in-flight work");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Work task panicked");
            }
        }

        let stats = counters.snapshot();
        info!(?stats, "Dispatcher stopped");
        Ok(stats)
    }

    /// Return a key taken after shutdown began without working it.
    async fn hand_back(&self, counters: &Counters, key: &str) {
        debug!(key, "Returning work item fetched during shutdown");
        if let Err(e) = self.source.requeue(key).await {
            error!(key, error = %e, "Failed to return work item");
            return;
        }
        counters.requeued.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.source.ack(key).await {
            warn!(key, error = %e, "Failed to acknowledge work item");
        }
    }
}

/// Decide what happens to a failed key. Returns whether the key can be
/// acknowledged, which is false only when a requeue was attempted and failed.
async fn handle_failure(
    source: &dyn DispatchSource,
    counters: &Counters,
    attempts: &Attempts,
    policy: RequeuePolicy,
    cancel: &CancellationToken,
    key: &str,
    err: &ExecutorError,
) -> bool {
    let interrupted = matches!(err, ExecutorError::Cancelled);
    if !interrupted && !(policy.enabled && err.is_retryable()) {
        error!(key, error = %err, "Work item failed");
        attempts.forget(key);
        return true;
    }

    // Work interrupted by shutdown goes straight back without using up an attempt.
    if !interrupted {
        let attempt = attempts.record(key);
        if attempt >= policy.max_attempts {
            error!(key, attempt, error = %err, "Work item failed, giving up");
            attempts.forget(key);
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let delay = policy.delay.saturating_mul(attempt);
        warn!(key, attempt, ?delay, error = %err, "Work item failed, requeueing");
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    match source.requeue(key).await {
        Ok(()) => {
            counters.requeued.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            error!(key, error = %e, "Failed to requeue work item");
            false
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("concurrency", &self.concurrency)
            .field("requeue", &self.requeue)
            .finish_non_exhaustive()
    }
}
