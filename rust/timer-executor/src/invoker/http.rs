//! `reqwest` callback transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};

use super::{CallbackRequest, CallbackTransport, Invocation};
use crate::error::{ExecutorError, ExecutorResult};
use crate::model::{HttpMethod, ResponseBody};

/// JSON callback client backed by one connection-pooled [`Client`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport with a per-request timeout and idle pool bound.
    pub fn new(timeout: Duration, pool_max_idle_per_host: usize) -> ExecutorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Decode a callback response into a JSON object.
///
/// An empty body (or JSON `null`) decodes to `None`; anything that is not a
/// JSON object is a decode failure.
pub fn decode_body(bytes: &[u8]) -> ExecutorResult<Option<ResponseBody>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<serde_json::Value>(bytes)? {
        serde_json::Value::Object(map) => Ok(Some(map)),
        serde_json::Value::Null => Ok(None),
        other => Err(ExecutorError::Decode(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn send(&self, request: CallbackRequest) -> Invocation {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        // Strings are sent verbatim; other JSON values as application/json.
        builder = match request.body {
            Some(serde_json::Value::String(raw)) => builder.body(raw),
            Some(value) => builder.json(&value),
            None => builder,
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Invocation::failed(e.into()),
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Invocation::failed(e.into()),
        };

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            bytes = bytes.len(),
            "Callback responded"
        );

        let decoded = decode_body(&bytes);
        if !status.is_success() {
            return Invocation::partial(
                decoded.ok().flatten(),
                ExecutorError::HttpStatus {
                    status: status.as_u16(),
                },
            );
        }

        match decoded {
            Ok(body) => Invocation::succeeded(body),
            Err(e) => Invocation::failed(e),
        }
    }
}
