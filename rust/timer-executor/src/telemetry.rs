//! Tracing setup and startup timing helpers.

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::error::{ExecutorError, ExecutorResult};

const DEFAULT_FILTER: &str = "timer_executor=info";
const DEFAULT_SERVICE_NAME: &str = "timer-executor";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter, `LOG_FORMAT=json` switches to JSON
/// output and `OTEL_ENABLED=true` adds an OTLP span exporter.
pub fn init_tracing() -> ExecutorResult<()> {
    let service_name =
        env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let otel_enabled = env::var("OTEL_ENABLED")
        .unwrap_or_default()
        .parse::<bool>()
        .unwrap_or(false);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let fmt_layer = if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let otel_layer = if otel_enabled {
        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| {
                ExecutorError::Configuration(format!("Failed to create exporter: {e}"))
            })?;

        let tracer_provider = trace::TracerProvider::builder()
            .with_resource(Resource::new(vec![
                opentelemetry::KeyValue::new(SERVICE_NAME, service_name.clone()),
                opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ]))
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .build();

        global::set_tracer_provider(tracer_provider.clone());
        Some(tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(DEFAULT_SERVICE_NAME)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| ExecutorError::Configuration(format!("Failed to install subscriber: {e}")))?;

    if otel_enabled {
        tracing::info!(
            service = service_name,
            endpoint = endpoint,
            "OpenTelemetry tracing initialized"
        );
    }

    Ok(())
}

/// Flush and stop the OTLP exporter, if any.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

/// Logs how long a startup phase took.
///
/// ```rust,ignore
/// let timer = OpTimer::new("redis", "connection");
/// let conn = connect().await;
/// timer.finish_with_result(conn.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        tracing::debug!(component, operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        tracing::info!(
            component = self.component,
            operation = self.operation,
            duration_ms = self.elapsed_ms(),
            "Operation completed"
        );
    }

    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        match result {
            Ok(_) => self.finish(),
            Err(e) => tracing::error!(
                component = self.component,
                operation = self.operation,
                duration_ms = self.elapsed_ms(),
                error = %e,
                "Operation failed"
            ),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_timer_finishes_without_subscriber() {
        let timer = OpTimer::new("sqlite", "migration");
        timer.finish_with_result::<(), ExecutorError>(Err(&ExecutorError::Storage(
            "locked".into(),
        )));
        OpTimer::new("redis", "connection").finish();
    }
}
