//! Execution tier of a distributed delayed-task scheduler.
//!
//! Work items arrive as `{timer_id}_{run_unix_millis}` keys. Each one is
//! deduplicated, its timer loaded, the configured HTTP callback invoked and
//! the outcome written back onto the pre-created task record.

pub mod app;
pub mod bloom;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod invoker;
pub mod key;
pub mod model;
pub mod monitor;
pub mod recorder;
pub mod store;
pub mod telemetry;
pub mod timer_service;
pub mod worker;

pub use config::Config;
pub use dedup::{DedupGate, Verdict};
pub use dispatch::{ChannelSource, DispatchSource, DispatchStats, Dispatcher, RedisListSource};
pub use error::{ExecutorError, ExecutorResult};
pub use key::TaskKey;
pub use worker::{WorkOutcome, Worker};
