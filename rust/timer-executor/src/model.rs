//! Timer definitions and task records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::key::TaskKey;

/// Generic JSON object returned by a callback.
pub type ResponseBody = serde_json::Map<String, serde_json::Value>;

/// Whether a timer is allowed to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Enabled,
    Disabled,
}

impl TimerStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Enabled),
            2 => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// HTTP methods a callback can be dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the configured body is sent with this method.
    pub fn carries_body(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a configured method is not one of [`HttpMethod`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl FromStr for HttpMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// Callback configuration of a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyParam {
    /// Method as configured through the admin API; validated at execution time.
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl NotifyParam {
    /// Parse the configured method, naming the timer on failure.
    pub fn http_method(&self, timer_name: &str) -> Result<HttpMethod, ExecutorError> {
        self.method
            .parse()
            .map_err(|UnknownMethod(method)| ExecutorError::UnsupportedMethod {
                method,
                timer: timer_name.to_string(),
            })
    }
}

/// A schedulable job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub id: u64,
    pub name: String,
    /// Owning application, used as the metrics label.
    pub app: String,
    pub status: TimerStatus,
    pub notify_http_param: NotifyParam,
}

impl TimerDefinition {
    pub fn is_enabled(&self) -> bool {
        self.status == TimerStatus::Enabled
    }
}

/// Outcome state of one scheduled occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotRun,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::NotRun => 0,
            Self::Success => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::NotRun),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states are never reverted.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotRun)
    }
}

/// One scheduled occurrence of a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub timer_id: u64,
    pub app: String,
    /// Expected execution instant in unix milliseconds.
    pub run_timer: i64,
    pub status: TaskStatus,
    /// Serialized callback response.
    #[serde(default)]
    pub output: String,
    /// Invocation wall-clock duration in milliseconds.
    #[serde(default)]
    pub cost_time: i64,
    /// Failure message when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskRecord {
    /// A fresh record as created by the scheduling producer.
    pub fn not_run(key: TaskKey, app: impl Into<String>) -> Self {
        Self {
            timer_id: key.timer_id,
            app: app.into(),
            run_timer: key.run_unix_millis,
            status: TaskStatus::NotRun,
            output: String::new(),
            cost_time: 0,
            error: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.timer_id, self.run_timer)
    }
}
