//! Work item key codec.
//!
//! A work item key identifies one scheduled occurrence of a timer. The
//! producer and this executor share the same encoding: `{timer_id}_{run_unix_millis}`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{ExecutorError, ExecutorResult};

/// Separator between the timer id and the execution timestamp.
pub const KEY_SEPARATOR: char = '_';

/// Prefix of the per-day bloom filter bucket.
pub const BLOOM_BUCKET_PREFIX: &str = "task_bloom_";

/// Decoded work item key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Timer definition id.
    pub timer_id: u64,
    /// Expected execution instant in unix milliseconds.
    pub run_unix_millis: i64,
}

impl TaskKey {
    #[must_use]
    pub const fn new(timer_id: u64, run_unix_millis: i64) -> Self {
        Self {
            timer_id,
            run_unix_millis,
        }
    }

    /// Encode into the shared string form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.timer_id, self.run_unix_millis)
    }

    /// Decode a key produced by [`TaskKey::encode`].
    pub fn decode(key: &str) -> ExecutorResult<Self> {
        let (id, unix) = key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| ExecutorError::malformed_key(key, "missing separator"))?;

        if unix.contains(KEY_SEPARATOR) {
            return Err(ExecutorError::malformed_key(key, "too many components"));
        }

        let timer_id = id
            .parse::<u64>()
            .map_err(|e| ExecutorError::malformed_key(key, format!("timer id: {e}")))?;
        let run_unix_millis = unix
            .parse::<i64>()
            .map_err(|e| ExecutorError::malformed_key(key, format!("run timestamp: {e}")))?;

        Ok(Self::new(timer_id, run_unix_millis))
    }

    /// Expected execution instant, if representable.
    #[must_use]
    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.run_unix_millis)
    }

    /// Calendar day (UTC) of the expected execution instant, `YYYY-MM-DD`.
    #[must_use]
    pub fn day(&self) -> String {
        self.run_at()
            .unwrap_or_default()
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Bloom filter bucket this key belongs to.
    #[must_use]
    pub fn day_bucket(&self) -> String {
        format!("{BLOOM_BUCKET_PREFIX}{}", self.day())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.timer_id, self.run_unix_millis)
    }
}

impl FromStr for TaskKey {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode() {
        let key = TaskKey::new(42, 1_700_000_000_000);
        assert_eq!(key.encode(), "42_1700000000000");
        assert_eq!(TaskKey::decode("42_1700000000000").unwrap(), key);
        assert_eq!(key.to_string(), key.encode());
    }

    #[test]
    fn test_negative_timestamp() {
        let key = TaskKey::decode("7_-1000").unwrap();
        assert_eq!(key.run_unix_millis, -1000);
    }

    #[test]
    fn test_malformed_keys() {
        for bad in ["", "42", "42_", "_1700", "a_1700", "42_b", "42_1_2", "-1_1700", "42 _1700"] {
            let err = TaskKey::decode(bad).unwrap_err();
            assert!(
                matches!(err, ExecutorError::MalformedKey { .. }),
                "expected MalformedKey for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_day_bucket() {
        let key = TaskKey::new(42, 1_700_000_000_000);
        assert_eq!(key.day(), "2023-11-14");
        assert_eq!(key.day_bucket(), "task_bloom_2023-11-14");
    }

    proptest! {
        #[test]
        fn prop_codec_round_trip(timer_id in any::<u64>(), unix in any::<i64>()) {
            let key = TaskKey::new(timer_id, unix);
            prop_assert_eq!(TaskKey::decode(&key.encode()).unwrap(), key);
        }
    }
}
