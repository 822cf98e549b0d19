//! Durable stores for timer definitions and task records.
//!
//! Both stores are owned by external components; the executor only reads
//! timer definitions and transitions existing task records.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::ExecutorResult;
use crate::key::TaskKey;
use crate::model::{TaskRecord, TimerDefinition};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Read access to timer definitions.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Load a timer, failing with `TimerNotFound` when absent.
    async fn get_timer(&self, timer_id: u64) -> ExecutorResult<TimerDefinition>;
}

/// Authoritative record of each scheduled occurrence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch the record for `key`, `None` when the producer has not created it.
    async fn get_task(&self, key: TaskKey) -> ExecutorResult<Option<TaskRecord>>;

    /// Persist status, output and cost of an existing record.
    ///
    /// Fails with `RecordNotFound` if the record does not exist. A record is
    /// never moved back to `NotRun`.
    async fn update_task(&self, record: &TaskRecord) -> ExecutorResult<()>;
}
