//! In-memory stores for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{TaskStore, TimerStore};
use crate::error::{ExecutorError, ExecutorResult};
use crate::key::TaskKey;
use crate::model::{TaskRecord, TaskStatus, TimerDefinition};

/// Timer and task store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    timers: RwLock<HashMap<u64, TimerDefinition>>,
    tasks: RwLock<HashMap<TaskKey, TaskRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a timer definition.
    pub fn insert_timer(&self, timer: TimerDefinition) {
        self.timers.write().insert(timer.id, timer);
    }

    /// Create a task record the way the scheduling producer does.
    pub fn insert_task(&self, record: TaskRecord) {
        self.tasks.write().insert(record.key(), record);
    }

    /// Snapshot of a task record.
    pub fn task(&self, key: TaskKey) -> Option<TaskRecord> {
        self.tasks.read().get(&key).cloned()
    }
}

#[async_trait]
impl TimerStore for InMemoryStore {
    async fn get_timer(&self, timer_id: u64) -> ExecutorResult<TimerDefinition> {
        self.timers
            .read()
            .get(&timer_id)
            .cloned()
            .ok_or(ExecutorError::TimerNotFound { timer_id })
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn get_task(&self, key: TaskKey) -> ExecutorResult<Option<TaskRecord>> {
        Ok(self.tasks.read().get(&key).cloned())
    }

    async fn update_task(&self, record: &TaskRecord) -> ExecutorResult<()> {
        if record.status == TaskStatus::NotRun {
            return Err(ExecutorError::Storage(
                "task status cannot be reset to not_run".to_string(),
            ));
        }

        let mut tasks = self.tasks.write();
        let existing = tasks
            .get_mut(&record.key())
            .ok_or(ExecutorError::RecordNotFound {
                timer_id: record.timer_id,
                run_timer: record.run_timer,
            })?;
        existing.status = record.status;
        existing.output.clone_from(&record.output);
        existing.cost_time = record.cost_time;
        existing.error.clone_from(&record.error);
        Ok(())
    }
}
