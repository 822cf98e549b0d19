//! Process wiring: backends named by [`Config`], the worker built over them,
//! and the dispatch loop with its metrics side tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bloom::{ProbabilisticSet, RedisBloomFilter};
use crate::config::Config;
use crate::dedup::DedupGate;
use crate::dispatch::{DispatchSource, DispatchStats, Dispatcher, RedisListSource};
use crate::invoker::{CallbackTransport, HttpTransport, Invoker};
use crate::monitor::{self, MetricsSink, MonitorReporter, PrometheusReporter};
use crate::recorder::ResultRecorder;
use crate::store::{SqliteStore, TaskStore, TimerStore};
use crate::telemetry::OpTimer;
use crate::timer_service::TimerService;
use crate::worker::Worker;

/// Everything the pipeline reaches outside the process.
pub struct Backends {
    pub timers: Arc<dyn TimerStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub filter: Arc<dyn ProbabilisticSet>,
    pub transport: Arc<dyn CallbackTransport>,
    pub source: Arc<dyn DispatchSource>,
}

impl Backends {
    /// Open the SQLite store, connect Redis and build the callback client.
    ///
    /// Work items left unacknowledged by a previous run are moved back onto
    /// the queue before this returns.
    pub async fn connect(config: &Config) -> Result<Self> {
        let timer = OpTimer::new("sqlite", "open");
        let store = SqliteStore::new(&config.database.path).await;
        timer.finish_with_result(store.as_ref());
        let store = Arc::new(store.context("Failed to open task database")?);

        let timer = OpTimer::new("redis", "connection");
        let filter = RedisBloomFilter::connect(&config.redis.url, config.bloom_hasher()).await;
        timer.finish_with_result(filter.as_ref());
        let filter = filter.context("Failed to connect bloom filter")?;

        let source = RedisListSource::connect(
            &config.redis.url,
            config.redis.queue.clone(),
            config.poll_interval(),
        )
        .await
        .context("Failed to connect dispatch queue")?;
        source
            .recover()
            .await
            .context("Failed to recover unacknowledged work items")?;

        let transport = HttpTransport::new(config.http_timeout(), config.http.pool_max_idle_per_host)
            .context("Failed to build callback client")?;

        let timers: Arc<dyn TimerStore> = Arc::<SqliteStore>::clone(&store);
        Ok(Self {
            timers,
            tasks: store,
            filter: Arc::new(filter),
            transport: Arc::new(transport),
            source: Arc::new(source),
        })
    }

    /// Pipeline over these backends, reporting through `reporter`.
    pub fn worker(&self, config: &Config, reporter: MonitorReporter) -> Worker {
        Worker::new(
            DedupGate::new(Arc::clone(&self.filter), Arc::clone(&self.tasks))
                .with_ttl(config.bloom_ttl()),
            TimerService::new(Arc::clone(&self.timers)),
            Invoker::new(Arc::clone(&self.transport)),
            ResultRecorder::new(Arc::clone(&self.tasks)),
            reporter,
        )
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Dispatch until `cancel` fires or the source closes.
///
/// Returns once in-flight work, pending monitor reports and the metrics
/// server have all finished.
pub async fn run(
    config: &Config,
    backends: Backends,
    cancel: CancellationToken,
) -> Result<DispatchStats> {
    let prometheus = Arc::new(PrometheusReporter::new()?);
    let sink: Arc<dyn MetricsSink> = Arc::<PrometheusReporter>::clone(&prometheus);
    let (reporter, monitor_task) = MonitorReporter::spawn(sink, config.worker.monitor_buffer);

    // Side tasks stop with the dispatcher even when the source closes first.
    let side_tasks = cancel.child_token();
    let metrics_task = config.metrics.enabled.then(|| {
        let port = config.metrics.port;
        let cancel = side_tasks.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor::serve_metrics(prometheus, port, cancel).await {
                tracing::error!("Failed to start metrics server: {}", e);
            }
        })
    });

    let worker = backends.worker(config, reporter);
    let dispatcher = Dispatcher::new(backends.source, worker, config.worker.concurrency)
        .with_requeue_on_error(config.worker.requeue_on_error)
        .with_requeue_policy(config.requeue_delay(), config.worker.max_attempts);

    let stats = dispatcher.run(cancel).await;
    side_tasks.cancel();

    // Dropping the dispatcher releases the last reporter so the drain ends.
    drop(dispatcher);
    let _ = monitor_task.await;
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    let stats = stats?;
    info!(?stats, "Pipeline stopped");
    Ok(stats)
}
