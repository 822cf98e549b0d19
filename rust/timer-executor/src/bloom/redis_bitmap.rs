//! Redis-backed bloom filter shared by all executors.
//!
//! Each day bucket is one Redis bitmap. Membership reads pipeline one
//! `GETBIT` per hash; inserts pipeline the `SETBIT`s and the bucket `EXPIRE`
//! in a single `MULTI`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{BloomHasher, ProbabilisticSet};
use crate::error::ExecutorResult;

#[derive(Clone)]
pub struct RedisBloomFilter {
    conn: ConnectionManager,
    hasher: BloomHasher,
}

impl RedisBloomFilter {
    /// Connect to `redis_url` and build a filter with the given geometry.
    pub async fn connect(redis_url: &str, hasher: BloomHasher) -> ExecutorResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, hasher))
    }

    #[must_use]
    pub fn new(conn: ConnectionManager, hasher: BloomHasher) -> Self {
        Self { conn, hasher }
    }
}

impl std::fmt::Debug for RedisBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBloomFilter")
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProbabilisticSet for RedisBloomFilter {
    async fn exists(&self, bucket: &str, item: &str) -> ExecutorResult<bool> {
        let mut pipe = redis::pipe();
        for offset in self.hasher.offsets(item) {
            pipe.cmd("GETBIT").arg(bucket).arg(offset);
        }

        let mut conn = self.conn.clone();
        let bits: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(!bits.is_empty() && bits.iter().all(|bit| *bit == 1))
    }

    async fn set(&self, bucket: &str, item: &str, ttl: Duration) -> ExecutorResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for offset in self.hasher.offsets(item) {
            pipe.cmd("SETBIT").arg(bucket).arg(offset).arg(1).ignore();
        }
        pipe.cmd("EXPIRE").arg(bucket).arg(ttl.as_secs()).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::trace!(bucket, item, ttl_secs = ttl.as_secs(), "Bloom filter marker set");
        Ok(())
    }
}
