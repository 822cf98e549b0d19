//! Probabilistic "already processed" markers.
//!
//! The filter is advisory: a negative answer is trusted, a positive answer
//! has to be confirmed against the task store. Buckets are scoped per
//! calendar day so stale markers expire on their own.

pub mod memory;
pub mod redis_bitmap;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecutorResult;

pub use memory::InMemoryBloomFilter;
pub use redis_bitmap::RedisBloomFilter;

/// Set membership with false positives and no false negatives.
#[async_trait]
pub trait ProbabilisticSet: Send + Sync {
    /// Whether `item` may have been inserted into `bucket`.
    async fn exists(&self, bucket: &str, item: &str) -> ExecutorResult<bool>;

    /// Insert `item` into `bucket` and (re)arm the bucket expiry.
    async fn set(&self, bucket: &str, item: &str, ttl: Duration) -> ExecutorResult<()>;
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
// Second seed for double hashing.
const FNV_ALT_BASIS: u64 = 0x8422_2325_cbf2_9ce4;

fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    data.iter().fold(seed, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps an item onto `hashes` bit offsets within a `bits`-wide bitmap.
///
/// Offsets must be identical across processes since Redis-backed buckets are
/// shared, so the hash is a fixed FNV-1a rather than `std`'s randomized hasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomHasher {
    bits: u64,
    hashes: u32,
}

impl BloomHasher {
    #[must_use]
    pub fn new(bits: u64, hashes: u32) -> Self {
        Self {
            bits: bits.max(1),
            hashes: hashes.max(1),
        }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    /// Bit offsets for `item`.
    pub fn offsets(&self, item: &str) -> Vec<u64> {
        let h1 = fnv1a(FNV_OFFSET_BASIS, item.as_bytes());
        let h2 = fnv1a(FNV_ALT_BASIS, item.as_bytes()) | 1;
        (0..u64::from(self.hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
            .collect()
    }
}

impl Default for BloomHasher {
    fn default() -> Self {
        Self::new(1 << 24, 4)
    }
}
