//! Recognition Service Client
//!
//! HTTP plumbing shared by signature sync and server-side search: Basic
//! authentication, proxy routing, cooperative cancellation, streamed bodies
//! with slow-connection detection, and status to [`ErrorKind`] mapping.

pub mod proxy;
pub mod search;
pub mod wire;

use futures_util::StreamExt;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ApiSettings;
use crate::error::{ErrorKind, Result, ScanError};
use proxy::ProxyConfig;
use wire::ErrorBody;

/// API key and secret of the account owning the signature set
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    api_key: String,
    api_secret: String,
}

impl Credential {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Authenticated client for the recognition service
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
    low_speed_limit: u64,
    low_speed_time: Duration,
}

impl ApiClient {
    pub fn new(settings: &ApiSettings, credential: Credential, proxy: Option<&ProxyConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.request_timeout())
            .user_agent(concat!("scanner-toolkit/", env!("CARGO_PKG_VERSION")));

        builder = match proxy {
            Some(proxy) => builder.proxy(proxy.to_reqwest()?),
            None => builder.no_proxy(),
        };

        let http = builder
            .build()
            .map_err(|e| ScanError::new(ErrorKind::Misuse, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            credential,
            low_speed_limit: settings.low_speed_limit,
            low_speed_time: settings.low_speed_time(),
        })
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_json<R>(&self, path: &str, token: &CancellationToken) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let request = self.http.get(self.url(path));
        let body = self.execute(request, token).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn post_json<B, R>(&self, path: &str, payload: &B, token: &CancellationToken) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self.http.post(self.url(path)).json(payload);
        let body = self.execute(request, token).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send a request and read its body, racing both against cancellation
    async fn execute(&self, request: RequestBuilder, token: &CancellationToken) -> Result<Vec<u8>> {
        let request = request.basic_auth(self.credential.api_key(), Some(self.credential.api_secret()));

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ScanError::aborted()),
            result = self.send_and_read(request) => result,
        }
    }

    async fn send_and_read(&self, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = request.send().await?;
        let status = response.status();
        debug!("Service answered {} for {}", status, response.url().path());

        let body = self.read_body(response).await?;
        if !status.is_success() {
            let err = map_status(status, &body);
            warn!("Service request failed: {}", err);
            return Err(err);
        }
        Ok(body)
    }

    /// Read the body while watching throughput
    async fn read_body(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;

        loop {
            let next = if self.low_speed_time.is_zero() {
                stream.next().await
            } else {
                match tokio::time::timeout(self.low_speed_time, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Err(slow_connection(0, self.low_speed_time)),
                }
            };

            let Some(chunk) = next else { break };
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            window_bytes += chunk.len() as u64;

            let elapsed = window_start.elapsed();
            if !self.low_speed_time.is_zero() && elapsed >= self.low_speed_time {
                let rate = window_bytes as f64 / elapsed.as_secs_f64();
                if rate < self.low_speed_limit as f64 {
                    return Err(slow_connection(window_bytes, elapsed));
                }
                window_start = Instant::now();
                window_bytes = 0;
            }
        }
        Ok(body)
    }
}

fn slow_connection(bytes: u64, elapsed: Duration) -> ScanError {
    ScanError::new(
        ErrorKind::SlowConn,
        format!("received {} bytes in {:.1}s", bytes, elapsed.as_secs_f64()),
    )
}

/// Classify a non-success status, using the JSON error code when present
pub(crate) fn map_status(status: StatusCode, body: &[u8]) -> ScanError {
    let error_body: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let code = error_body.error.as_deref().unwrap_or("");
    let detail = match &error_body.message {
        Some(message) => format!("status {}: {}", status.as_u16(), message),
        None => format!("status {}", status.as_u16()),
    };

    if code == "empty" {
        return ScanError::new(ErrorKind::Empty, detail);
    }

    let kind = match status {
        StatusCode::UNAUTHORIZED => match code {
            "invalid_key" => ErrorKind::ApiKey,
            "invalid_secret" => ErrorKind::ApiSecret,
            _ => ErrorKind::Auth,
        },
        StatusCode::FORBIDDEN => ErrorKind::NoPerm,
        StatusCode::NOT_FOUND => ErrorKind::NoRec,
        StatusCode::CONFLICT => ErrorKind::CredMismatch,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavail,
        _ => ErrorKind::NetworkFail,
    };
    ScanError::new(kind, detail)
}
