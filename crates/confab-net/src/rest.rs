//! Authenticated REST transport.
//!
//! Non-queued calls (session bootstrap, query pages, connectivity
//! probes) go through [`RestTransport::request_with_retry`], which
//! retries 502/503/504 a fixed number of times with a flat delay.
//! Queued writes are dispatched by the sync queue through the plain
//! [`HttpExecutor::execute`] path, which applies no retry of its own;
//! the queue owns its retry policy.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use confab_shared::constants::{REST_RETRY_COUNT, REST_RETRY_DELAY};
use confab_shared::TransportFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("authorization".to_string(), format!("Bearer {token}")));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Outcome of a REST call. Transport-level errors never surface as
/// `Err`; a network-layer failure is reported with `status == 0`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub success: bool,
    pub data: Value,
}

impl HttpResponse {
    pub fn network_failure(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            success: false,
            data: json!({"code": "network_error", "message": message.into()}),
        }
    }

    /// 502/503/504, the statuses the flat REST retry applies to.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, 502 | 503 | 504)
    }

    /// Convert a failed response into the structured error object
    /// surfaced to the application.
    pub fn failure(&self, url: &str) -> TransportFailure {
        let code = self
            .data
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or(if self.status == 0 {
                "network_error"
            } else {
                "server_rejected"
            })
            .to_string();
        let message = self
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        let mut failure = TransportFailure::new(&code, message).with_url(url);
        if self.status != 0 {
            failure = failure.with_status(self.status);
        }
        failure
    }
}

/// Seam between the SDK and the HTTP stack, so the sync queue and the
/// online tracker can be exercised against a scripted server in tests.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResponse;
}

/// Production executor backed by a shared `reqwest` client.
pub struct RestTransport {
    http: reqwest::Client,
}

impl RestTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Execute with the flat retry policy for non-queued calls.
    pub async fn request_with_retry(&self, request: HttpRequest) -> HttpResponse {
        execute_with_retry(self, request).await
    }
}

/// The flat retry policy for non-queued calls: up to
/// [`REST_RETRY_COUNT`] retries, [`REST_RETRY_DELAY`] apart, only for
/// 502/503/504. Queued writes never come through here; the sync queue
/// owns their retry policy.
pub async fn execute_with_retry(executor: &dyn HttpExecutor, request: HttpRequest) -> HttpResponse {
    let mut response = executor.execute(request.clone()).await;
    let mut retries = 0;
    while response.is_transient() && retries < REST_RETRY_COUNT {
        retries += 1;
        debug!(
            url = %request.url,
            status = response.status,
            retry = retries,
            "Retrying transient REST failure"
        );
        tokio::time::sleep(REST_RETRY_DELAY).await;
        response = executor.execute(request.clone()).await;
    }
    response
}

impl Default for RestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpExecutor for RestTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResponse {
        let mut builder = self
            .http
            .request(request.method.as_reqwest(), &request.url)
            .header("accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let success = response.status().is_success();
                let data = response.json::<Value>().await.unwrap_or(Value::Null);
                HttpResponse {
                    status,
                    success,
                    data,
                }
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "REST request failed at network level");
                HttpResponse::network_failure(e.to_string())
            }
        }
    }
}

/// Connectivity probe backed by a lightweight REST endpoint. Any
/// HTTP-level response, including a 4xx, proves the server reachable;
/// only a network-layer failure counts as offline.
pub struct RestProbe {
    executor: std::sync::Arc<dyn HttpExecutor>,
    url: String,
}

impl RestProbe {
    pub fn new(executor: std::sync::Arc<dyn HttpExecutor>, url: impl Into<String>) -> Self {
        Self {
            executor,
            url: url.into(),
        }
    }
}

#[async_trait]
impl crate::online::ConnectivityProbe for RestProbe {
    async fn check(&self) -> bool {
        let response = self
            .executor
            .execute(HttpRequest::new(HttpMethod::Get, self.url.clone()))
            .await;
        response.status != 0
    }
}
