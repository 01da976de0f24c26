//! Policy-checking proxy that replaces every outbound network primitive.
//!
//! The proxy is the only path from guest code to the network. It rejects
//! hosts outside the allow-list, hard-stops at the request quota, and
//! notifies the governor of every breach so the run is terminated even if
//! the guest swallows the error.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::policy::{normalize_host, NetworkPolicy};
use crate::types::{SecurityViolation, Severity, ViolationKind};

use super::ViolationLog;

/// Read timeout for proxied requests.
const READ_TIMEOUT_SECS: u64 = 30;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum response body handed back to the guest (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

const USER_AGENT: &str = concat!("construct-sandbox/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Why the proxy asked the governor to stop the run.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkFault {
    PolicyViolation { host: String },
    QuotaExceeded { limit: u32 },
}

impl NetworkFault {
    pub fn to_error(&self) -> SandboxError {
        match self {
            Self::PolicyViolation { host } => {
                SandboxError::NetworkPolicyViolation(format!("host '{host}' is not allowed"))
            }
            Self::QuotaExceeded { limit } => SandboxError::NetworkQuotaExceeded { limit: *limit },
        }
    }
}

/// Performs the actual transfer once the proxy has approved a request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse>;
}

/// Default transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            // Redirects could leave the allow-list behind the proxy's back.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                anyhow::bail!("response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)");
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;
        if body.len() > MAX_RESPONSE_SIZE {
            anyhow::bail!(
                "response too large ({} bytes, limit is {MAX_RESPONSE_SIZE} bytes)",
                body.len()
            );
        }

        Ok(FetchResponse {
            status,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Per-run network proxy. One instance per isolated context.
pub struct NetworkProxy {
    policy: NetworkPolicy,
    transport: Arc<dyn HttpTransport>,
    request_count: AtomicU32,
    closed: AtomicBool,
    faults: mpsc::UnboundedSender<NetworkFault>,
    violations: Arc<ViolationLog>,
}

impl NetworkProxy {
    pub fn new(
        policy: NetworkPolicy,
        transport: Arc<dyn HttpTransport>,
        violations: Arc<ViolationLog>,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkFault>) {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let proxy = Self {
            policy,
            transport,
            request_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            faults,
            violations,
        };
        (proxy, fault_rx)
    }

    /// Requests admitted so far. Never exceeds `max_requests`.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    /// Refuses every further request. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Checks `request` against the policy and forwards it to the transport.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, SandboxError> {
        if self.is_closed() {
            return Err(SandboxError::Cancelled);
        }

        let url = url::Url::parse(&request.url).map_err(|e| {
            SandboxError::NetworkPolicyViolation(format!("invalid URL '{}': {e}", request.url))
        })?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(SandboxError::NetworkPolicyViolation(format!(
                    "unsupported scheme '{scheme}' (only http/https)"
                )));
            }
        }
        let host = normalize_host(url.host_str().unwrap_or(""));

        if !self.policy.allows(&host) {
            warn!(host = %host, "Blocked request to host outside the allow-list");
            return Err(self.breach(NetworkFault::PolicyViolation { host }));
        }

        // Reserve a slot atomically so concurrent calls cannot overshoot.
        let limit = self.policy.max_requests;
        let reserved = self
            .request_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            });
        if reserved.is_err() {
            warn!(limit, "Network request quota exhausted");
            return Err(self.breach(NetworkFault::QuotaExceeded { limit }));
        }

        debug!(method = %request.method, host = %host, "Proxying guest request");
        let started = Instant::now();
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| SandboxError::GuestRuntime(format!("fetch {} failed: {e}", request.url)))?;

        if let Some(rate) = self.policy.max_bandwidth_bytes_per_sec {
            let floor = Duration::from_secs_f64(response.body.len() as f64 / rate as f64);
            let elapsed = started.elapsed();
            if floor > elapsed {
                tokio::time::sleep(floor - elapsed).await;
            }
        }

        if self.is_closed() {
            return Err(SandboxError::Cancelled);
        }
        Ok(response)
    }

    fn breach(&self, fault: NetworkFault) -> SandboxError {
        let error = fault.to_error();
        let context = match &fault {
            NetworkFault::PolicyViolation { host } => json!({ "host": host }),
            NetworkFault::QuotaExceeded { limit } => json!({ "limit": limit }),
        };
        self.violations.push(
            SecurityViolation::new(ViolationKind::Network, Severity::High, error.to_string())
                .with_context(context),
        );
        let _ = self.faults.send(fault);
        error
    }
}
