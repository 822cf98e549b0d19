use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::bloom::BloomHasher;
use crate::error::{ExecutorError, ExecutorResult};

/// Executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Redis connection and work queue
    #[serde(default)]
    pub redis: RedisConfig,

    /// Timer and task database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Outbound callback client
    #[serde(default)]
    pub http: HttpConfig,

    /// Dispatch loop
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Dedup bloom filter
    #[serde(default)]
    pub bloom: BloomConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (default: redis://127.0.0.1:6379)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// List holding pending work item keys
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Idle poll interval when the queue is empty (default: 200ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Callback request timeout in seconds (default: 10s)
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Idle connections kept per callback host (default: 32)
    #[serde(default = "default_pool_idle")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum in-flight work items (default: 64)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Push retryable failures back onto the queue (default: true)
    #[serde(default = "default_true")]
    pub requeue_on_error: bool,

    /// Base delay before a failed key is requeued, multiplied by its attempt
    /// number (default: 1000ms)
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_ms: u64,

    /// Failed attempts per key before it is dropped (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pending monitor reports before new ones are dropped (default: 1024)
    #[serde(default = "default_monitor_buffer")]
    pub monitor_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    /// Day bucket lifetime in seconds (default: 48h)
    #[serde(default = "default_bloom_ttl")]
    pub ttl_secs: u64,

    /// Bitmap width per bucket (default: 2^24)
    #[serde(default = "default_bloom_bits")]
    pub bits: u64,

    /// Hash functions per item (default: 4)
    #[serde(default = "default_bloom_hashes")]
    pub hashes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Metrics server port (default: 2113)
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Serve metrics at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_queue() -> String {
    "timer_executor:pending".to_string()
}
fn default_poll_interval() -> u64 {
    200
}
fn default_database_path() -> String {
    "data/timers.db".to_string()
}
fn default_http_timeout() -> u64 {
    10
}
fn default_pool_idle() -> usize {
    32
}
fn default_concurrency() -> usize {
    64
}
fn default_requeue_delay() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_monitor_buffer() -> usize {
    1024
}
fn default_bloom_ttl() -> u64 {
    48 * 60 * 60
}
fn default_bloom_bits() -> u64 {
    1 << 24
}
fn default_bloom_hashes() -> u32 {
    4
}
fn default_metrics_port() -> u16 {
    2113
}
fn default_true() -> bool {
    true
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            queue: default_queue(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            pool_max_idle_per_host: default_pool_idle(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            requeue_on_error: true,
            requeue_delay_ms: default_requeue_delay(),
            max_attempts: default_max_attempts(),
            monitor_buffer: default_monitor_buffer(),
        }
    }
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_bloom_ttl(),
            bits: default_bloom_bits(),
            hashes: default_bloom_hashes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load() -> ExecutorResult<Self> {
        if let Ok(config_path) = env::var("EXECUTOR_CONFIG_PATH") {
            Self::from_file(&config_path)
        } else if Path::new("/app/config/executor.yaml").exists() {
            Self::from_file("/app/config/executor.yaml")
        } else if Path::new("config/executor.yaml").exists() {
            Self::from_file("config/executor.yaml")
        } else {
            Ok(Self::from_env(Self::default()))
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> ExecutorResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExecutorError::Configuration(format!("Failed to read config file {path}: {e}"))
        })?;

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ExecutorError::Configuration(format!("Failed to parse config: {e}"))
        })?;

        Ok(Self::from_env(config))
    }

    /// Override configuration with environment variables
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("REDIS_URL") {
            config.redis.url = v;
        }
        if let Ok(v) = env::var("DISPATCH_QUEUE") {
            config.redis.queue = v;
        }

        if let Ok(v) = env::var("DATABASE_PATH") {
            config.database.path = v;
        }

        if let Ok(v) = env::var("HTTP_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.http.timeout_secs = secs;
            }
        }

        if let Ok(v) = env::var("WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                config.worker.concurrency = n;
            }
        }

        if let Ok(v) = env::var("BLOOM_TTL_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.bloom.ttl_secs = secs;
            }
        }

        if let Ok(v) = env::var("METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.metrics.port = port;
            }
        }

        config
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.worker.requeue_delay_ms)
    }

    pub fn bloom_ttl(&self) -> Duration {
        Duration::from_secs(self.bloom.ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.redis.poll_interval_ms)
    }

    pub fn bloom_hasher(&self) -> BloomHasher {
        BloomHasher::new(self.bloom.bits, self.bloom.hashes)
    }
}
