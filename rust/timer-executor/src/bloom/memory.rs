//! Process-local bloom filter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BloomHasher, ProbabilisticSet};
use crate::error::ExecutorResult;

#[derive(Debug)]
struct Bucket {
    words: Vec<u64>,
    expires_at: Instant,
}

impl Bucket {
    fn new(bits: u64, expires_at: Instant) -> Self {
        let words = usize::try_from(bits.div_ceil(64)).unwrap_or(usize::MAX);
        Self {
            words: vec![0; words],
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn get(&self, offset: u64) -> bool {
        usize::try_from(offset / 64)
            .ok()
            .and_then(|idx| self.words.get(idx))
            .is_some_and(|word| word & (1 << (offset % 64)) != 0)
    }

    fn set(&mut self, offset: u64) {
        if let Some(word) = usize::try_from(offset / 64)
            .ok()
            .and_then(|idx| self.words.get_mut(idx))
        {
            *word |= 1 << (offset % 64);
        }
    }
}

/// In-memory bloom filter with per-bucket expiry.
///
/// Suitable for a single executor process or for tests; multiple executors
/// should share a [`super::RedisBloomFilter`].
#[derive(Debug, Default)]
pub struct InMemoryBloomFilter {
    hasher: BloomHasher,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl InMemoryBloomFilter {
    #[must_use]
    pub fn new(hasher: BloomHasher) -> Self {
        Self {
            hasher,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired buckets.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_expired(now));
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

#[async_trait]
impl ProbabilisticSet for InMemoryBloomFilter {
    async fn exists(&self, bucket: &str, item: &str) -> ExecutorResult<bool> {
        let now = Instant::now();
        let buckets = self.buckets.read();
        let Some(bits) = buckets.get(bucket).filter(|b| !b.is_expired(now)) else {
            return Ok(false);
        };
        Ok(self.hasher.offsets(item).into_iter().all(|o| bits.get(o)))
    }

    async fn set(&self, bucket: &str, item: &str, ttl: Duration) -> ExecutorResult<()> {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut buckets = self.buckets.write();
        let entry = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Bucket::new(self.hasher.bits(), expires_at));
        if entry.is_expired(now) {
            *entry = Bucket::new(self.hasher.bits(), expires_at);
        }
        for offset in self.hasher.offsets(item) {
            entry.set(offset);
        }
        entry.expires_at = expires_at;
        Ok(())
    }
}
