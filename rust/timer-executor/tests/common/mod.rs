// Shared test doubles for the integration tests
#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use timer_executor::bloom::ProbabilisticSet;
use timer_executor::invoker::{CallbackRequest, CallbackTransport, Invocation, Invoker};
use timer_executor::key::TaskKey;
use timer_executor::model::{NotifyParam, ResponseBody, TaskRecord, TimerDefinition, TimerStatus};
use timer_executor::monitor::MonitorReporter;
use timer_executor::recorder::ResultRecorder;
use timer_executor::store::{InMemoryStore, TaskStore};
use timer_executor::timer_service::TimerService;
use timer_executor::{DedupGate, ExecutorError, ExecutorResult, Worker};

/// Task store that counts reads before delegating.
#[derive(Debug, Default)]
pub struct CountingTaskStore {
    pub inner: InMemoryStore,
    pub reads: AtomicUsize,
}

impl CountingTaskStore {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for CountingTaskStore {
    async fn get_task(&self, key: TaskKey) -> ExecutorResult<Option<TaskRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_task(key).await
    }

    async fn update_task(&self, record: &TaskRecord) -> ExecutorResult<()> {
        self.inner.update_task(record).await
    }
}

/// Filter with a fixed answer that remembers what was marked.
#[derive(Debug)]
pub struct ScriptedFilter {
    pub answer: Mutex<ExecutorResult<bool>>,
    pub marked: Mutex<Vec<(String, String)>>,
}

impl ScriptedFilter {
    pub fn answering(present: bool) -> Self {
        Self {
            answer: Mutex::new(Ok(present)),
            marked: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Mutex::new(Err(ExecutorError::Storage("redis: connection refused".into()))),
            marked: Mutex::new(Vec::new()),
        }
    }

    pub fn set_answer(&self, present: bool) {
        *self.answer.lock() = Ok(present);
    }

    pub fn marked(&self) -> Vec<(String, String)> {
        self.marked.lock().clone()
    }
}

#[async_trait]
impl ProbabilisticSet for ScriptedFilter {
    async fn exists(&self, _bucket: &str, _item: &str) -> ExecutorResult<bool> {
        match &*self.answer.lock() {
            Ok(present) => Ok(*present),
            Err(e) => Err(ExecutorError::Storage(e.to_string())),
        }
    }

    async fn set(&self, bucket: &str, item: &str, _ttl: Duration) -> ExecutorResult<()> {
        self.marked.lock().push((bucket.to_string(), item.to_string()));
        Ok(())
    }
}

/// Transport that records requests and replies with a canned invocation.
#[derive(Debug)]
pub struct RecordingTransport {
    pub requests: Mutex<Vec<CallbackRequest>>,
    reply: Mutex<Option<Value>>,
    fail_with: Mutex<Option<String>>,
    hold: Option<Arc<Notify>>,
}

impl RecordingTransport {
    /// Replies `200` with `{"ok": true}`.
    pub fn ok() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            reply: Mutex::new(Some(json!({"ok": true}))),
            fail_with: Mutex::new(None),
            hold: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        let transport = Self::ok();
        *transport.fail_with.lock() = Some(message.to_string());
        transport
    }

    /// Blocks each send until `release` is notified.
    pub fn held(release: Arc<Notify>) -> Self {
        Self {
            hold: Some(release),
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn send(&self, request: CallbackRequest) -> Invocation {
        self.requests.lock().push(request);
        if let Some(release) = &self.hold {
            release.notified().await;
        }
        if let Some(message) = self.fail_with.lock().clone() {
            return Invocation::failed(ExecutorError::Invocation(message));
        }
        let body: Option<ResponseBody> = self
            .reply
            .lock()
            .as_ref()
            .and_then(|v| v.as_object().cloned());
        Invocation::succeeded(body)
    }
}

pub const TIMER_ID: u64 = 42;
pub const RUN_MILLIS: i64 = 1_700_000_000_000;

pub fn key() -> TaskKey {
    TaskKey::new(TIMER_ID, RUN_MILLIS)
}

pub fn timer(method: &str) -> TimerDefinition {
    TimerDefinition {
        id: TIMER_ID,
        name: "settle-invoice".to_string(),
        app: "billing".to_string(),
        status: TimerStatus::Enabled,
        notify_http_param: NotifyParam {
            method: method.to_string(),
            url: "https://x/cb".to_string(),
            header: HashMap::from([("X-Token".to_string(), "secret".to_string())]),
            body: Some(json!({"a": 1})),
        },
    }
}

/// Everything a worker test needs to poke at.
pub struct Harness {
    pub tasks: Arc<CountingTaskStore>,
    pub timers: Arc<InMemoryStore>,
    pub filter: Arc<ScriptedFilter>,
    pub transport: Arc<RecordingTransport>,
    pub worker: Worker,
}

impl Harness {
    pub fn new(filter: ScriptedFilter, transport: RecordingTransport) -> Self {
        let tasks = Arc::new(CountingTaskStore::default());
        let timers = Arc::new(InMemoryStore::new());
        let filter = Arc::new(filter);
        let transport = Arc::new(transport);

        let worker = Worker::new(
            DedupGate::new(filter.clone(), tasks.clone()),
            TimerService::new(timers.clone()),
            Invoker::new(transport.clone()),
            ResultRecorder::new(tasks.clone()),
            MonitorReporter::disabled(),
        );

        Self {
            tasks,
            timers,
            filter,
            transport,
            worker,
        }
    }

    /// Seed the timer and a `NotRun` record for [`key`].
    pub fn seed(self, timer: TimerDefinition) -> Self {
        self.tasks
            .inner
            .insert_task(TaskRecord::not_run(key(), timer.app.clone()));
        self.timers.insert_timer(timer);
        self
    }

    pub fn record(&self) -> TaskRecord {
        self.tasks.inner.task(key()).expect("task record seeded")
    }
}
