//! Remote transport abstraction and its HTTP implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use offsync_common::{Error, HttpMethod, Result};
use offsync_storage::OfflineAction;

/// A request replayed against the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// The request a queued action stands for. The body is only carried for
    /// methods that take one.
    pub fn for_action(action: &OfflineAction) -> Self {
        Self {
            method: action.method,
            endpoint: action.endpoint.clone(),
            headers: action.headers.clone(),
            body: if action.method.has_body() {
                action.data.clone()
            } else {
                None
            },
        }
    }

    /// A read of `endpoint` with the given headers.
    pub fn get(endpoint: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            method: HttpMethod::Get,
            endpoint: endpoint.into(),
            headers,
            body: None,
        }
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// Delivers requests to the remote service.
///
/// Implementations resolve with a response only for 2xx statuses; anything
/// else is an error.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http").
    fn name(&self) -> &str;

    /// Send one request.
    ///
    /// # Errors
    /// - `Error::Network` for transport failures and non-2xx statuses
    /// - `Error::Timeout` when the request exceeds the transport deadline
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse>;
}

/// JSON-over-HTTP transport.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url`. Relative endpoints are
    /// resolved against it.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, endpoint: &str) -> Result<Url> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Url::parse(endpoint)
                .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", endpoint, e)));
        }
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", endpoint, e)))
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let url = self.url_for(&request.endpoint)?;
        debug!("{} {}", request.method, url);

        let mut builder = self
            .http
            .request(Self::method(request.method), url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{} {}", request.method, url))
            } else {
                Error::Network(format!("{} {} failed: {}", request.method, url, e))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Network(format!(
                "{} {} returned {}: {}",
                request.method, url, status, text
            )));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(RemoteResponse {
            status: status.as_u16(),
            body,
        })
    }
}

type Responder = Box<dyn Fn(&RemoteRequest) -> Result<RemoteResponse> + Send + Sync>;

/// Scripted transport for testing.
///
/// Every request is recorded and answered by a caller-supplied function.
/// An optional latency makes concurrency observable through
/// [`max_in_flight`](Self::max_in_flight).
pub struct ScriptedTransport {
    responder: Responder,
    latency: Duration,
    requests: Mutex<Vec<RemoteRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    /// Answer every request with `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RemoteRequest) -> Result<RemoteResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer every request with `200 {}`.
    pub fn ok() -> Self {
        Self::new(|_| Ok(RemoteResponse::ok(Value::Object(Default::default()))))
    }

    /// Fail every request with a network error.
    pub fn failing() -> Self {
        Self::new(|request| {
            Err(Error::Network(format!(
                "{} {} returned 503",
                request.method, request.endpoint
            )))
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Number of requests received with `method` for `endpoint`.
    pub fn count(&self, method: HttpMethod, endpoint: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.endpoint == endpoint)
            .count()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = (self.responder)(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        result
    }
}
