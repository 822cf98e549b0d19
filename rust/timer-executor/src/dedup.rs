//! Two-tier duplicate suppression.
//!
//! A per-day [`ProbabilisticSet`] answers "maybe processed" cheaply. Negative
//! answers are trusted. Positive answers, and filter failures, are confirmed
//! against the [`TaskStore`], which is the source of truth.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::bloom::ProbabilisticSet;
use crate::error::ExecutorResult;
use crate::key::TaskKey;
use crate::model::TaskStatus;
use crate::store::TaskStore;

/// Default lifetime of a day bucket, long enough to cover late redeliveries.
pub const DEFAULT_BLOOM_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Filter negative; the store was not consulted.
    Fresh,
    /// Filter positive (or unavailable) but the record is absent or `NotRun`.
    Unconfirmed,
    /// The record already reached a terminal status.
    Duplicate(TaskStatus),
}

impl Verdict {
    pub fn should_execute(self) -> bool {
        !matches!(self, Self::Duplicate(_))
    }
}

#[derive(Clone)]
pub struct DedupGate {
    filter: Arc<dyn ProbabilisticSet>,
    tasks: Arc<dyn TaskStore>,
    ttl: Duration,
}

impl DedupGate {
    pub fn new(filter: Arc<dyn ProbabilisticSet>, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            filter,
            tasks,
            ttl: DEFAULT_BLOOM_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Decide whether `key` still needs executing.
    ///
    /// Fails only when the authoritative lookup fails.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn check(&self, key: TaskKey) -> ExecutorResult<Verdict> {
        let bucket = key.day_bucket();
        let item = key.encode();

        match self.filter.exists(&bucket, &item).await {
            Ok(false) => return Ok(Verdict::Fresh),
            Ok(true) => debug!(bucket = %bucket, "Bloom filter hit, verifying against task store"),
            Err(e) => warn!(bucket = %bucket, error = %e, "Bloom filter check failed, verifying against task store"),
        }

        match self.tasks.get_task(key).await? {
            Some(record) if record.status.is_terminal() => {
                debug!(status = ?record.status, "Task already executed");
                Ok(Verdict::Duplicate(record.status))
            }
            Some(_) | None => Ok(Verdict::Unconfirmed),
        }
    }

    /// Record `key` in its day bucket. Failures are logged and swallowed.
    pub async fn mark_done(&self, key: TaskKey) {
        let bucket = key.day_bucket();
        if let Err(e) = self.filter.set(&bucket, &key.encode(), self.ttl).await {
            warn!(key = %key, bucket = %bucket, error = %e, "Failed to mark task in bloom filter");
        }
    }
}

impl std::fmt::Debug for DedupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGate")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
