//! Timer definition loading.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::ExecutorResult;
use crate::model::TimerDefinition;
use crate::store::TimerStore;

/// Loads the full timer definition for a work item.
#[derive(Clone)]
pub struct TimerService {
    store: Arc<dyn TimerStore>,
}

impl TimerService {
    pub fn new(store: Arc<dyn TimerStore>) -> Self {
        Self { store }
    }

    /// Fetch a timer, failing with `TimerNotFound` or `Storage`.
    #[instrument(skip(self))]
    pub async fn get_timer(&self, timer_id: u64) -> ExecutorResult<TimerDefinition> {
        let timer = self.store.get_timer(timer_id).await?;
        debug!(
            timer_id,
            app = %timer.app,
            status = ?timer.status,
            method = %timer.notify_http_param.method,
            "Timer definition loaded"
        );
        Ok(timer)
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}
