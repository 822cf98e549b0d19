//! Callback invocation.
//!
//! The [`Invoker`] turns a timer's [`NotifyParam`](crate::model::NotifyParam)
//! into a [`CallbackRequest`] and hands it to a [`CallbackTransport`]. Methods
//! are resolved to [`HttpMethod`] before anything touches the network, so a
//! misconfigured timer fails with `UnsupportedMethod` without a request.
//! No retries happen here; redelivery belongs to the dispatch layer.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, instrument};

use crate::error::ExecutorError;
use crate::model::{HttpMethod, ResponseBody, TimerDefinition};

pub use http::HttpTransport;

/// One outbound callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Always `None` for GET.
    pub body: Option<serde_json::Value>,
}

/// Outcome of a callback: the decoded response (possibly partial) and the
/// error, if the invocation failed.
#[derive(Debug, Default)]
pub struct Invocation {
    pub response: Option<ResponseBody>,
    pub error: Option<ExecutorError>,
}

impl Invocation {
    pub fn succeeded(response: Option<ResponseBody>) -> Self {
        Self {
            response,
            error: None,
        }
    }

    pub fn failed(error: ExecutorError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }

    /// Failure that still produced a response body worth recording.
    pub fn partial(response: Option<ResponseBody>, error: ExecutorError) -> Self {
        Self {
            response,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Sends callback requests. Implementations share one pooled client.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn send(&self, request: CallbackRequest) -> Invocation;
}

/// Executes the callback configured on a timer.
#[derive(Clone)]
pub struct Invoker {
    transport: Arc<dyn CallbackTransport>,
}

impl Invoker {
    pub fn new(transport: Arc<dyn CallbackTransport>) -> Self {
        Self { transport }
    }

    /// Build the request for `timer`, or `UnsupportedMethod`.
    pub fn build_request(timer: &TimerDefinition) -> Result<CallbackRequest, ExecutorError> {
        let param = &timer.notify_http_param;
        let method = param.http_method(&timer.name)?;
        let body = match method {
            HttpMethod::Get => None,
            HttpMethod::Post | HttpMethod::Patch | HttpMethod::Delete => param.body.clone(),
        };

        Ok(CallbackRequest {
            method,
            url: param.url.clone(),
            headers: param.header.clone(),
            body,
        })
    }

    #[instrument(skip(self, timer), fields(timer_id = timer.id, app = %timer.app))]
    pub async fn execute(&self, timer: &TimerDefinition) -> Invocation {
        let invocation = match Self::build_request(timer) {
            Ok(request) => self.transport.send(request).await,
            Err(e) => Invocation::failed(e),
        };

        if let Some(e) = &invocation.error {
            error!(
                timer_id = timer.id,
                url = %timer.notify_http_param.url,
                error = %e,
                "Exec timer callback failed"
            );
        }

        invocation
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").finish_non_exhaustive()
    }
}
