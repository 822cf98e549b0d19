//! Persists the outcome of an invocation onto its task record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::error::{ExecutorError, ExecutorResult};
use crate::key::TaskKey;
use crate::model::{ResponseBody, TaskRecord, TaskStatus};
use crate::store::TaskStore;

/// Writes status, output and cost time onto pre-created task records.
#[derive(Clone)]
pub struct ResultRecorder {
    store: Arc<dyn TaskStore>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Transition the record for `key` to `Success` or `Failed`.
    ///
    /// The record must already exist; the executor never creates one.
    #[instrument(skip(self, response, exec_error), fields(key = %key))]
    pub async fn update(
        &self,
        key: TaskKey,
        response: Option<&ResponseBody>,
        exec_error: Option<&ExecutorError>,
        cost: Duration,
    ) -> ExecutorResult<TaskRecord> {
        let mut record = self
            .store
            .get_task(key)
            .await?
            .ok_or(ExecutorError::RecordNotFound {
                timer_id: key.timer_id,
                run_timer: key.run_unix_millis,
            })?;

        record.output = serialize_output(response)?;
        record.cost_time = i64::try_from(cost.as_millis()).unwrap_or(i64::MAX);
        match exec_error {
            Some(e) => {
                record.status = TaskStatus::Failed;
                record.error = Some(e.to_string());
            }
            None => {
                record.status = TaskStatus::Success;
                record.error = None;
            }
        }

        self.store.update_task(&record).await?;

        info!(
            timer_id = key.timer_id,
            run_timer = key.run_unix_millis,
            status = ?record.status,
            cost_ms = record.cost_time,
            "Task record updated"
        );
        Ok(record)
    }
}

/// Empty response serializes to an empty payload.
fn serialize_output(response: Option<&ResponseBody>) -> ExecutorResult<String> {
    match response {
        Some(body) => Ok(serde_json::to_string(body)?),
        None => Ok(String::new()),
    }
}

impl std::fmt::Debug for ResultRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultRecorder").finish_non_exhaustive()
    }
}
