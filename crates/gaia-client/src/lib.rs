//! HTTP client for inter-service calls in the GAIA SOA.
//!
//! Retries transient failures with exponential backoff and, once primary
//! attempts are exhausted, makes exactly one attempt against an optional
//! HA fallback endpoint. Timeouts are never retried and never failed
//! over: a slow service is alive, and masking that with failover would
//! hide the real problem. When the fallback also fails, the original
//! primary error is surfaced so diagnosis points at the real outage.

#![forbid(unsafe_code)]

use gaia_persist::MaintenanceFlag;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// HTTP status codes that indicate the service is restarting rather than
/// broken.
const RETRYABLE_STATUS: [u16; 3] = [502, 503, 504];

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Tagged failure classification; retry logic dispatches on the variant.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, remote protocol error, or 502/503/504.
    /// Retried, and eligible for failover once retries are exhausted.
    #[error("transient error calling {url}: {message}")]
    Transient {
        url: String,
        message: String,
        status: Option<u16>,
    },

    /// The request timed out. Not retried, not failed over.
    #[error("timeout calling {url}")]
    Timeout { url: String },

    /// A non-retryable HTTP status (4xx, 500, ...).
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The response body was not the expected JSON.
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            Self::Decode {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else {
            // Connect errors and torn connections (remote protocol
            // errors) are both worth a retry.
            Self::Transient {
                url: url.to_string(),
                message: err.to_string(),
                status: None,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Explicit knobs for retry and failover; sites must not hard-code these.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum attempts against the primary endpoint.
    pub max_attempts: u32,
    /// Base backoff delay; doubles each attempt.
    pub base_delay: Duration,
    /// Optional HA fallback base URL.
    pub fallback_url: Option<String>,
    /// Maintenance flag; when set, failover is suppressed.
    pub maintenance: Option<MaintenanceFlag>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            fallback_url: None,
            maintenance: None,
        }
    }
}

// ─── ServiceClient ───────────────────────────────────────────────────────────

/// HTTP client for one GAIA service endpoint.
pub struct ServiceClient {
    service_name: String,
    base_url: String,
    config: ClientConfig,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Delete,
}

impl ServiceClient {
    pub fn new(service_name: &str, base_url: &str, config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        debug!(
            service = service_name,
            base_url = %base_url,
            fallback = config.fallback_url.as_deref().unwrap_or("-"),
            "service client initialized"
        );
        Self {
            service_name: service_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            http,
        }
    }

    /// Resolve the base URL from an environment variable, falling back
    /// to the Docker network naming convention
    /// `http://<service>:<port>`. When `endpoint_env` is None the
    /// variable name is derived from the service name
    /// (`<SERVICE>_ENDPOINT`, dashes become underscores).
    pub fn from_env(
        service_name: &str,
        default_port: u16,
        endpoint_env: Option<&str>,
        config: ClientConfig,
    ) -> Self {
        let derived = format!("{}_ENDPOINT", service_name.to_uppercase().replace('-', "_"));
        let env_var = endpoint_env.unwrap_or(&derived);
        let base_url = std::env::var(env_var)
            .unwrap_or_else(|_| format!("http://{service_name}:{default_port}"));
        Self::new(service_name, &base_url, config)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value> {
        self.request(Method::Get, path, None).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        self.request(Method::Post, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<serde_json::Value> {
        self.request(Method::Delete, path, None).await
    }

    /// True iff the service's `/health` endpoint reports healthy.
    pub async fn health_check(&self) -> bool {
        match self.get("/health").await {
            Ok(body) => body.get("status").and_then(|v| v.as_str()) == Some("healthy"),
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "health check failed");
                false
            }
        }
    }

    // ─── Internal ─────────────────────────────────────────────────────────

    fn maintenance_active(&self) -> bool {
        self.config
            .maintenance
            .as_ref()
            .is_some_and(MaintenanceFlag::is_set)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let mut last_err: Option<ClientError> = None;

        for attempt in 1..=self.config.max_attempts {
            match self.send_once(method, &url, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e @ ClientError::Transient { .. }) => {
                    if attempt < self.config.max_attempts {
                        let delay = self.config.base_delay * 2u32.pow(attempt - 1);
                        warn!(
                            service = %self.service_name,
                            url = %url,
                            attempt,
                            max_attempts = self.config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
                // Timeouts, hard statuses, and decode failures surface
                // immediately.
                Err(e) => return Err(e),
            }
        }

        let primary_err = last_err.unwrap_or(ClientError::Transient {
            url: url.clone(),
            message: "exhausted attempts".to_string(),
            status: None,
        });

        // Primary exhausted on a retryable failure: a single fallback
        // attempt, unless maintenance mode pins traffic to the primary.
        if let Some(fallback_base) = self.config.fallback_url.as_deref() {
            if self.maintenance_active() {
                info!(
                    service = %self.service_name,
                    "maintenance mode active, failover suppressed"
                );
                return Err(primary_err);
            }
            let fallback_url = format!("{}{path}", fallback_base.trim_end_matches('/'));
            warn!(
                service = %self.service_name,
                primary = %url,
                fallback = %fallback_url,
                "primary exhausted, attempting HA fallback"
            );
            match self.send_once(method, &fallback_url, body.as_ref()).await {
                Ok(value) => {
                    info!(service = %self.service_name, fallback = %fallback_url, "HA fallback succeeded");
                    return Ok(value);
                }
                Err(fallback_err) => {
                    warn!(
                        service = %self.service_name,
                        fallback = %fallback_url,
                        error = %fallback_err,
                        "HA fallback also failed, surfacing primary error"
                    );
                    return Err(primary_err);
                }
            }
        }

        Err(primary_err)
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let request = match method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url).json(body.unwrap_or(&serde_json::json!({}))),
            Method::Delete => self.http.delete(url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(url, e))?;

        let status = response.status().as_u16();
        if RETRYABLE_STATUS.contains(&status) {
            return Err(ClientError::Transient {
                url: url.to_string(),
                message: format!("HTTP {status}"),
                status: Some(status),
            });
        }
        if !response.status().is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::from_reqwest(url, e))
    }
}

// ─── Preconfigured clients ───────────────────────────────────────────────────

/// Client for the GPU orchestrator (`ORCHESTRATOR_ENDPOINT`). No HA
/// fallback: the orchestrator is the single writer of GPU custody.
pub fn orchestrator_client(config: ClientConfig) -> ServiceClient {
    ServiceClient::from_env("gaia-orchestrator", 6410, Some("ORCHESTRATOR_ENDPOINT"), config)
}
