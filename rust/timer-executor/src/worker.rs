//! Per-work-item execution pipeline.
//!
//! `decode -> dedup -> load timer -> invoke -> report -> record -> mark done`.
//! Every suspension point before the record write races the cancellation
//! token. The record write itself is never raced, so a cancelled item either
//! leaves its record at `NotRun` or lands it in a terminal status.

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::dedup::{DedupGate, Verdict};
use crate::error::{ExecutorError, ExecutorResult};
use crate::invoker::Invoker;
use crate::key::TaskKey;
use crate::model::TaskStatus;
use crate::monitor::MonitorReporter;
use crate::recorder::ResultRecorder;
use crate::timer_service::TimerService;

/// How a work item finished. All three are successful completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Callback invoked and the outcome recorded.
    Executed { status: TaskStatus },
    /// Already executed; nothing was done.
    Duplicate,
    /// Timer disabled; nothing was done.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Worker {
    dedup: DedupGate,
    timers: TimerService,
    invoker: Invoker,
    recorder: ResultRecorder,
    monitor: MonitorReporter,
}

impl Worker {
    pub fn new(
        dedup: DedupGate,
        timers: TimerService,
        invoker: Invoker,
        recorder: ResultRecorder,
        monitor: MonitorReporter,
    ) -> Self {
        Self {
            dedup,
            timers,
            invoker,
            recorder,
            monitor,
        }
    }

    /// Process one `{timer_id}_{run_unix_millis}` work item.
    ///
    /// Callback failures are recorded on the task and do not fail the item.
    /// Decode, load and record failures do.
    #[instrument(skip(self, cancel))]
    pub async fn work(&self, cancel: &CancellationToken, key: &str) -> ExecutorResult<WorkOutcome> {
        let key = TaskKey::decode(key)?;

        let verdict = until_cancelled(cancel, self.dedup.check(key)).await??;
        if let Verdict::Duplicate(status) = verdict {
            warn!(
                timer_id = key.timer_id,
                run_timer = key.run_unix_millis,
                status = ?status,
                "Task is already executed"
            );
            return Ok(WorkOutcome::Duplicate);
        }

        let timer = until_cancelled(cancel, self.timers.get_timer(key.timer_id)).await??;
        if !timer.is_enabled() {
            warn!(timer_id = key.timer_id, "Timer has been disabled, skipping task");
            return Ok(WorkOutcome::Disabled);
        }

        let exec_time = Utc::now();
        let started = Instant::now();
        let invocation = until_cancelled(cancel, self.invoker.execute(&timer)).await?;
        let cost = started.elapsed();

        self.monitor.report(&timer.app, key.run_unix_millis, exec_time);

        let recorded = self
            .recorder
            .update(
                key,
                invocation.response.as_ref(),
                invocation.error.as_ref(),
                cost,
            )
            .await;

        self.dedup.mark_done(key).await;

        let record = recorded?;
        info!(
            timer_id = key.timer_id,
            run_timer = key.run_unix_millis,
            app = %timer.app,
            status = ?record.status,
            cost_ms = record.cost_time,
            "Task executed"
        );
        Ok(WorkOutcome::Executed {
            status: record.status,
        })
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> ExecutorResult<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ExecutorError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::bloom::{BloomHasher, InMemoryBloomFilter};
    use crate::invoker::{CallbackRequest, CallbackTransport, Invocation};
    use crate::model::{NotifyParam, ResponseBody, TaskRecord, TimerDefinition, TimerStatus};
    use crate::store::InMemoryStore;

    #[derive(Default)]
    struct OkTransport {
        calls: Mutex<Vec<CallbackRequest>>,
    }

    #[async_trait]
    impl CallbackTransport for OkTransport {
        async fn send(&self, request: CallbackRequest) -> Invocation {
            self.calls.lock().push(request);
            let mut body = ResponseBody::new();
            body.insert("ok".into(), json!(true));
            Invocation::succeeded(Some(body))
        }
    }

    fn timer(status: TimerStatus) -> TimerDefinition {
        TimerDefinition {
            id: 42,
            name: "callback".into(),
            app: "billing".into(),
            status,
            notify_http_param: NotifyParam {
                method: "POST".into(),
                url: "https://x/cb".into(),
                header: HashMap::new(),
                body: Some(json!({"a": 1})),
            },
        }
    }

    fn worker(store: Arc<InMemoryStore>, transport: Arc<OkTransport>) -> Worker {
        let filter = Arc::new(InMemoryBloomFilter::new(BloomHasher::new(1 << 12, 3)));
        Worker::new(
            DedupGate::new(filter, store.clone()),
            TimerService::new(store.clone()),
            Invoker::new(transport),
            ResultRecorder::new(store),
            MonitorReporter::disabled(),
        )
    }

    #[tokio::test]
    async fn test_malformed_key_fails_fast() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(OkTransport::default());
        let err = worker(store, transport.clone())
            .work(&CancellationToken::new(), "42-1700000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedKey { .. }));
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_executes_then_deduplicates() {
        let store = Arc::new(InMemoryStore::new());
        let key = TaskKey::new(42, 1_700_000_000_000);
        store.insert_timer(timer(TimerStatus::Enabled));
        store.insert_task(TaskRecord::not_run(key, "billing"));

        let transport = Arc::new(OkTransport::default());
        let worker = worker(store.clone(), transport.clone());
        let cancel = CancellationToken::new();

        let first = worker.work(&cancel, "42_1700000000000").await.unwrap();
        assert_eq!(
            first,
            WorkOutcome::Executed {
                status: TaskStatus::Success
            }
        );
        let second = worker.work(&cancel, "42_1700000000000").await.unwrap();
        assert_eq!(second, WorkOutcome::Duplicate);

        assert_eq!(transport.calls.lock().len(), 1);
        assert_eq!(store.task(key).unwrap().output, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_disabled_timer_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let key = TaskKey::new(42, 1_700_000_000_000);
        store.insert_timer(timer(TimerStatus::Disabled));
        store.insert_task(TaskRecord::not_run(key, "billing"));

        let transport = Arc::new(OkTransport::default());
        let outcome = worker(store.clone(), transport.clone())
            .work(&CancellationToken::new(), &key.encode())
            .await
            .unwrap();

        assert_eq!(outcome, WorkOutcome::Disabled);
        assert!(transport.calls.lock().is_empty());
        assert_eq!(store.task(key).unwrap().status, TaskStatus::NotRun);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_record_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let key = TaskKey::new(42, 1_700_000_000_000);
        store.insert_timer(timer(TimerStatus::Enabled));
        store.insert_task(TaskRecord::not_run(key, "billing"));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let transport = Arc::new(OkTransport::default());
        let err = worker(store.clone(), transport.clone())
            .work(&cancel, &key.encode())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(transport.calls.lock().is_empty());
        assert_eq!(store.task(key).unwrap().status, TaskStatus::NotRun);
    }
}
