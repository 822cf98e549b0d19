use thiserror::Error;

/// Core error type for the timer execution pipeline
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Work item key could not be decoded
    #[error("Malformed work item key '{key}': {reason}")]
    MalformedKey { key: String, reason: String },

    /// Timer definition lookup errors
    #[error("Timer {timer_id} not found")]
    TimerNotFound { timer_id: u64 },

    /// Task record lookup errors
    #[error("Task record not found, timer_id: {timer_id}, run_timer: {run_timer}")]
    RecordNotFound { timer_id: u64, run_timer: i64 },

    /// Durable store unavailable or write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Timer configured with a method the executor does not dispatch
    #[error("Invalid http method: {method}, timer: {timer}")]
    UnsupportedMethod { method: String, timer: String },

    /// Network/transport errors
    #[error("Callback request failed: {0}")]
    Invocation(String),

    #[error("Callback returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// Callback response could not be decoded
    #[error("Failed to decode callback response: {0}")]
    Decode(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Work item cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl ExecutorError {
    /// Whether redelivering the same work item may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimerNotFound { .. }
                | Self::RecordNotFound { .. }
                | Self::Storage(_)
                | Self::Cancelled
                | Self::Other(_)
        )
    }

    /// Whether the error belongs to the callback invocation itself.
    pub fn is_invocation_failure(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedMethod { .. }
                | Self::Invocation(_)
                | Self::HttpStatus { .. }
                | Self::Decode(_)
        )
    }

    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExecutorError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ExecutorError::HttpStatus {
                status: status.as_u16(),
            }
        } else {
            ExecutorError::Invocation(err.to_string())
        }
    }
}

impl From<redis::RedisError> for ExecutorError {
    fn from(err: redis::RedisError) -> Self {
        ExecutorError::Storage(format!("redis: {err}"))
    }
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(err: rusqlite::Error) -> Self {
        ExecutorError::Storage(format!("sqlite: {err}"))
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        ExecutorError::Decode(err.to_string())
    }
}
