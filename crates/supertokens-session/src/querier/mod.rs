//! HTTP client for the SuperTokens core
//!
//! Every recipe call carries `rid: session` and the negotiated `cdi-version`.
//! The API version is negotiated once per querier through `GET /apiversion`
//! and cached behind a mutex. Rate-limited calls (HTTP 429) are retried with
//! exponential backoff; each call owns its retry budget. Unreachable hosts are
//! skipped in round-robin order.

mod retry;

pub use retry::RetryConfig;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{GeneralError, Result, SessionError};

/// Core Driver Interface versions this SDK can speak, oldest first
pub const SUPPORTED_CDI_VERSIONS: &[&str] = &["2.21", "3.0", "3.1", "4.0", "5.0"];

const RECIPE_ID: &str = "session";

/// Outcome of talking to one host
enum HostError {
    /// Connection could not be established; the next host may work
    Unreachable(reqwest::Error),
    /// The host answered (or failed) in a way that another host would not fix
    Failed(SessionError),
}

/// Client for the core's HTTP API
pub struct CoreQuerier {
    hosts: Vec<String>,
    next_host: AtomicUsize,
    api_key: Option<SecretString>,
    http: reqwest::Client,
    retry: RetryConfig,
    api_version: Mutex<Option<String>>,
}

impl fmt::Debug for CoreQuerier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreQuerier")
            .field("hosts", &self.hosts)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CoreQuerier {
    /// Create a querier from the session configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the connection URI holds no host or
    /// the HTTP client cannot be built.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let hosts: Vec<String> = config
            .connection_uri
            .split(';')
            .map(|host| host.trim().trim_end_matches('/').to_string())
            .filter(|host| !host.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(SessionError::config("connectionURI does not contain any host"));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SessionError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            hosts,
            next_host: AtomicUsize::new(0),
            api_key: config.api_key.clone(),
            http,
            retry: RetryConfig::with_max_retries(config.max_retries),
            api_version: Mutex::new(None),
        })
    }

    /// Replace the rate-limit retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Configured core hosts
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Retry policy applied to each call
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// The CDI version negotiated with the core
    ///
    /// # Errors
    ///
    /// Fails when the core cannot be reached or shares no version with this SDK.
    pub async fn api_version(&self) -> Result<String> {
        let mut cached = self.api_version.lock().await;
        if let Some(version) = cached.as_ref() {
            return Ok(version.clone());
        }

        let response = self
            .send_to_hosts(Method::GET, "/apiversion", &[], None, None)
            .await?;
        let core_versions: Vec<&str> = response
            .get("versions")
            .and_then(Value::as_array)
            .map(|versions| versions.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let chosen = highest_common_version(&core_versions, SUPPORTED_CDI_VERSIONS).ok_or_else(
            || {
                SessionError::config(
                    "The running SuperTokens core version is not compatible with this backend SDK. \
                     Please update your core or SDK",
                )
            },
        )?;

        info!(cdi_version = %chosen, "Negotiated core API version");
        *cached = Some(chosen.clone());
        Ok(chosen)
    }

    /// `GET` a recipe path
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn send_get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        self.send(Method::GET, path, query, None).await
    }

    /// `POST` a JSON body to a recipe path
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn send_post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    /// `PUT` a JSON body to a recipe path
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn send_put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    /// `DELETE` a recipe path with query parameters
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn send_delete(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        self.send(Method::DELETE, path, query, None).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let version = self.api_version().await?;
        self.send_to_hosts(method, path, query, body, Some(&version))
            .await
    }

    async fn send_to_hosts(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        cdi_version: Option<&str>,
    ) -> Result<Value> {
        let start = self.next_host.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.hosts.len() {
            let host = &self.hosts[(start + offset) % self.hosts.len()];
            match self
                .send_with_retry(host, method.clone(), path, query, body, cdi_version)
                .await
            {
                Ok(value) => return Ok(value),
                Err(HostError::Unreachable(e)) => {
                    warn!(host = %host, path, error = %e, "Core host unreachable, trying next host");
                    last_error = Some(e);
                }
                Err(HostError::Failed(e)) => return Err(e),
            }
        }

        match last_error {
            Some(e) => Err(GeneralError::Transport(e).into()),
            None => Err(SessionError::invariant("core host list is empty")),
        }
    }

    async fn send_with_retry(
        &self,
        host: &str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        cdi_version: Option<&str>,
    ) -> std::result::Result<Value, HostError> {
        let url = format!("{host}{path}");
        let mut retries = 0u32;

        loop {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(version) = cdi_version {
                request = request
                    .header("rid", RECIPE_ID)
                    .header("cdi-version", version);
            }
            if let Some(key) = &self.api_key {
                request = request.header("api-key", key.expose_secret().as_str());
            }
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(%method, url = %url, attempt = retries + 1, "Sending request to core");
            let response = request.send().await.map_err(|e| {
                if e.is_connect() {
                    HostError::Unreachable(e)
                } else {
                    HostError::Failed(e.into())
                }
            })?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && self.retry.should_retry(retries) {
                retries += 1;
                let delay = self.retry.calculate_delay(retries);
                warn!(
                    url = %url,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    "Core rate limited the request, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                error!(url = %url, status = %status, "Core returned error status");
                return Err(HostError::Failed(
                    GeneralError::CoreStatus {
                        path: path.to_string(),
                        status: status.as_u16(),
                        body: text,
                    }
                    .into(),
                ));
            }

            let text = response
                .text()
                .await
                .map_err(|e| HostError::Failed(e.into()))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                HostError::Failed(
                    GeneralError::UnexpectedResponse {
                        path: path.to_string(),
                        message: format!("invalid JSON body: {e}"),
                    }
                    .into(),
                )
            });
        }
    }
}

fn parse_version(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

fn highest_common_version(core_versions: &[&str], sdk_versions: &[&str]) -> Option<String> {
    core_versions
        .iter()
        .filter(|version| sdk_versions.contains(version))
        .max_by_key(|version| parse_version(version))
        .map(|version| (*version).to_string())
}
