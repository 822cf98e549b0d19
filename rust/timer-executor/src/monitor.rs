//! Execution and delay metrics.
//!
//! Reports are pushed onto a bounded channel and drained by a detached task,
//! so the worker never waits on metrics. A full channel drops the report.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Destination of execution metrics.
pub trait MetricsSink: Send + Sync {
    /// Count one execution for `app`.
    fn report_exec_record(&self, app: &str) -> Result<()>;

    /// Observe the gap between the expected and actual firing instant.
    fn report_timer_delay_record(&self, app: &str, delay_ms: f64) -> Result<()>;
}

const DELAY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

/// Prometheus-backed [`MetricsSink`] with its own registry.
#[derive(Debug, Clone)]
pub struct PrometheusReporter {
    registry: Registry,
    exec_total: CounterVec,
    delay_ms: HistogramVec,
}

impl PrometheusReporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let exec_total = CounterVec::new(
            Opts::new("timer_executor_exec_total", "Total timer callbacks executed"),
            &["app"],
        )
        .context("Failed to create exec counter")?;

        let delay_ms = HistogramVec::new(
            HistogramOpts::new(
                "timer_executor_delay_milliseconds",
                "Delay between expected and actual callback execution",
            )
            .buckets(DELAY_BUCKETS_MS.to_vec()),
            &["app"],
        )
        .context("Failed to create delay histogram")?;

        registry
            .register(Box::new(exec_total.clone()))
            .context("Failed to register exec counter")?;
        registry
            .register(Box::new(delay_ms.clone()))
            .context("Failed to register delay histogram")?;

        Ok(Self {
            registry,
            exec_total,
            delay_ms,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        // If encoding fails, return empty metrics rather than panic
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn exec_count(&self, app: &str) -> Option<f64> {
        self.exec_total
            .get_metric_with_label_values(&[app])
            .ok()
            .map(|c| c.get())
    }

    pub fn delay_sample_count(&self, app: &str) -> Option<u64> {
        self.delay_ms
            .get_metric_with_label_values(&[app])
            .ok()
            .map(|h| h.get_sample_count())
    }
}

impl MetricsSink for PrometheusReporter {
    fn report_exec_record(&self, app: &str) -> Result<()> {
        self.exec_total.get_metric_with_label_values(&[app])?.inc();
        Ok(())
    }

    fn report_timer_delay_record(&self, app: &str, delay_ms: f64) -> Result<()> {
        self.delay_ms
            .get_metric_with_label_values(&[app])?
            .observe(delay_ms);
        Ok(())
    }
}

#[derive(Debug)]
struct ExecReport {
    app: String,
    expected_unix_millis: i64,
    actual: DateTime<Utc>,
}

/// Fire-and-forget front end over a [`MetricsSink`].
#[derive(Debug, Clone)]
pub struct MonitorReporter {
    tx: mpsc::Sender<ExecReport>,
}

impl MonitorReporter {
    /// Start the drain task. The task ends once every reporter clone is dropped.
    pub fn spawn(sink: Arc<dyn MetricsSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ExecReport>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                // Keys may carry any i64 timestamp; clamp rather than overflow.
                #[allow(clippy::cast_precision_loss, reason = "rounding is fine for a histogram")]
                let delay_ms = report
                    .actual
                    .timestamp_millis()
                    .saturating_sub(report.expected_unix_millis) as f64;

                if let Err(e) = sink.report_exec_record(&report.app) {
                    tracing::warn!(app = %report.app, error = %e, "Failed to report exec record");
                }
                if let Err(e) = sink.report_timer_delay_record(&report.app, delay_ms) {
                    tracing::warn!(app = %report.app, error = %e, "Failed to report delay record");
                }
            }
            tracing::debug!("Monitor reporter drained");
        });

        (Self { tx }, handle)
    }

    /// A reporter that discards everything.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Queue an execution report without waiting.
    pub fn report(&self, app: &str, expected_unix_millis: i64, actual: DateTime<Utc>) {
        let report = ExecReport {
            app: app.to_string(),
            expected_unix_millis,
            actual,
        };
        if let Err(e) = self.tx.try_send(report) {
            tracing::debug!(app, error = %e, "Monitor report dropped");
        }
    }
}

/// Serve the text exposition of `reporter` on `port` until `cancel` fires.
pub async fn serve_metrics(
    reporter: Arc<PrometheusReporter>,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    tracing::info!("Metrics server listening on http://0.0.0.0:{}", port);

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((mut stream, _)) => {
                let reporter = Arc::clone(&reporter);
                tokio::spawn(async move {
                    let body = reporter.gather_text();
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(resp.as_bytes()).await {
                        tracing::error!("Metrics write error: {:?}", e);
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {:?}", e);
            }
        }
    }

    Ok(())
}
