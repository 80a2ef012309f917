use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

const MAX_BODY_EXCERPT: usize = 256;

/// Why a single liveness or capability request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeFailure {
    #[error("request to {path} timed out")]
    Timeout { path: String },
    #[error("no response from {path}: {detail}")]
    NoResponse { path: String, detail: String },
    #[error("request to {path} was forbidden")]
    Forbidden { path: String },
    #[error("request to {path} failed with status {status}")]
    HttpStatus {
        path: String,
        status: u16,
        body: String,
    },
    #[error("failed to set up request to {path}: {detail}")]
    Setup { path: String, detail: String },
    #[error("invalid capability payload from {path}: {detail}")]
    InvalidPayload { path: String, detail: String },
}

impl ProbeFailure {
    /// User-facing retry message; distinct per classification.
    pub fn message(&self) -> String {
        match self {
            ProbeFailure::Timeout { .. } => "Connection timed out.".to_string(),
            ProbeFailure::NoResponse { .. } => {
                "Connection failed with no response from the server.".to_string()
            }
            ProbeFailure::Forbidden { .. } => {
                "Access to the session host was denied (403).".to_string()
            }
            ProbeFailure::HttpStatus { status, body, .. } => {
                format!("Connection failed with status {status}, and response \"{body}\".")
            }
            ProbeFailure::Setup { detail, .. } => {
                format!("Failed to create the connection request: {detail}.")
            }
            ProbeFailure::InvalidPayload { detail, .. } => {
                format!("The server sent an unreadable host configuration: {detail}.")
            }
        }
    }

    /// HTTP status when there was one, otherwise the failure kind.
    pub fn code(&self) -> String {
        match self {
            ProbeFailure::Timeout { .. } => "timeout".to_string(),
            ProbeFailure::NoResponse { .. } => "no_response".to_string(),
            ProbeFailure::Forbidden { .. } => StatusCode::FORBIDDEN.as_u16().to_string(),
            ProbeFailure::HttpStatus { status, .. } => status.to_string(),
            ProbeFailure::Setup { .. } => "setup".to_string(),
            ProbeFailure::InvalidPayload { .. } => "invalid_payload".to_string(),
        }
    }

    /// Path of the request that failed.
    pub fn source_path(&self) -> &str {
        match self {
            ProbeFailure::Timeout { path }
            | ProbeFailure::NoResponse { path, .. }
            | ProbeFailure::Forbidden { path }
            | ProbeFailure::HttpStatus { path, .. }
            | ProbeFailure::Setup { path, .. }
            | ProbeFailure::InvalidPayload { path, .. } => path,
        }
    }

    pub fn report(&self) -> ClientErrorReport {
        ClientErrorReport {
            code: self.code(),
            detail: self.message(),
            source_path: self.source_path().to_string(),
        }
    }

    pub(crate) fn from_reqwest(path: &str, err: reqwest::Error) -> Self {
        let path = path.to_string();
        if err.is_timeout() {
            ProbeFailure::Timeout { path }
        } else if err.is_builder() {
            ProbeFailure::Setup {
                path,
                detail: err.to_string(),
            }
        } else if err.is_decode() {
            ProbeFailure::InvalidPayload {
                path,
                detail: err.to_string(),
            }
        } else {
            ProbeFailure::NoResponse {
                path,
                detail: err.to_string(),
            }
        }
    }
}

/// Escalation delivered through the client error side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientErrorReport {
    pub code: String,
    pub detail: String,
    pub source_path: String,
}

impl ClientErrorReport {
    pub fn new(
        code: impl Into<String>,
        detail: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            source_path: source_path.into(),
        }
    }
}

#[async_trait]
pub trait ProbeBackend: Send + Sync {
    /// Liveness check; any 2xx counts as alive.
    async fn check_health(&self, url: &Url) -> Result<(), ProbeFailure>;

    /// Fetches the host capability payload, forwarded verbatim.
    async fn fetch_capabilities(&self, url: &Url) -> Result<Value, ProbeFailure>;
}

pub struct ReqwestProbeBackend {
    client: reqwest::Client,
}

impl ReqwestProbeBackend {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout.min(Duration::from_secs(3)))
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, ProbeFailure> {
        let path = url.path();
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| ProbeFailure::from_reqwest(path, err))?;
        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(ProbeFailure::Forbidden {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeFailure::HttpStatus {
                path: path.to_string(),
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProbeBackend for ReqwestProbeBackend {
    async fn check_health(&self, url: &Url) -> Result<(), ProbeFailure> {
        self.get(url).await.map(|_| ())
    }

    async fn fetch_capabilities(&self, url: &Url) -> Result<Value, ProbeFailure> {
        let response = self.get(url).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| ProbeFailure::from_reqwest(url.path(), err))
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
