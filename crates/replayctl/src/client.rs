//! HTTP client for the replayd daemon.
//!
//! Talks to the local control plane; every method maps to one endpoint.

use replay_core::{ExecutionStatus, Id, LogEntry, ResultRecord};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: replayd\n  → or set REPLAYD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check REPLAYD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure replayd is running\n  → check REPLAYD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::IoError(e.to_string())
    }
}

/// Response from POST /test/start.
#[derive(Debug, Deserialize)]
pub struct StartResponse {
    pub run_id: Id,
}

/// Response from the log endpoints.
#[derive(Debug, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}

/// Response from GET /test/export.
#[derive(Debug, Deserialize)]
pub struct ExportResponse {
    pub records: Vec<ResultRecord>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for replayd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Check if the daemon is healthy by probing /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    /// Wait for the daemon to become ready with a custom timeout.
    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle an error response from the API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        // Control verb misuse comes back as 409.
        if status == 409 {
            return ClientError::InvalidOperation(message);
        }

        ClientError::HttpError { status, message }
    }

    async fn post_verb(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Start a run.
    /// POST /test/start
    pub async fn start(&self) -> Result<Id, ClientError> {
        let response = self.post_verb("/test/start").await?;
        let body: StartResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.run_id)
    }

    /// POST /test/pause
    pub async fn pause(&self) -> Result<(), ClientError> {
        self.post_verb("/test/pause").await.map(|_| ())
    }

    /// POST /test/resume
    pub async fn resume(&self) -> Result<(), ClientError> {
        self.post_verb("/test/resume").await.map(|_| ())
    }

    /// POST /test/stop
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.post_verb("/test/stop").await.map(|_| ())
    }

    /// POST /test/restart
    pub async fn restart(&self) -> Result<(), ClientError> {
        self.post_verb("/test/restart").await.map(|_| ())
    }

    /// GET /test/status
    pub async fn status(&self) -> Result<ExecutionStatus, ClientError> {
        self.get_json("/test/status").await
    }

    /// Recent log entries.
    /// GET /test/logs?limit=N
    pub async fn logs(&self, limit: Option<usize>) -> Result<Vec<LogEntry>, ClientError> {
        let path = match limit {
            Some(n) => format!("/test/logs?limit={n}"),
            None => "/test/logs".to_string(),
        };
        let body: LogsResponse = self.get_json(&path).await?;
        Ok(body.logs)
    }

    /// The full, uncapped log trail.
    /// GET /test/logs/export
    pub async fn export_logs(&self) -> Result<Vec<LogEntry>, ClientError> {
        let body: LogsResponse = self.get_json("/test/logs/export").await?;
        Ok(body.logs)
    }

    /// Persisted result records.
    /// GET /test/export?scope=...&run_id=...
    pub async fn export(
        &self,
        all: bool,
        run_id: Option<&str>,
    ) -> Result<Vec<ResultRecord>, ClientError> {
        let path = if all {
            "/test/export?scope=all".to_string()
        } else {
            match run_id {
                Some(id) => format!("/test/export?scope=run&run_id={id}"),
                None => "/test/export?scope=run".to_string(),
            }
        };
        let body: ExportResponse = self.get_json(&path).await?;
        Ok(body.records)
    }
}
