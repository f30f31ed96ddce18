//! HTTP interface of the local request endpoint.
//!
//! Routes, all on loopback:
//! - `POST /patch` with a JSON body naming exactly one patch source;
//! - `GET /health` and `GET /` for liveness checks;
//! - `OPTIONS` preflight, answered with CORS headers for trusted origins only.
//!
//! Request bodies:
//! ```json
//! {"url":"https://smwtrolls.com/p/123.bps","name":"Level 1"}
//! {"patch_url":"https://smwtrolls.com/p/123.zip","level_name":"Level 1"}
//! {"path":"/home/me/hack.bps"}
//! {"hex":"42505331..."}
//! ```
//! Responses:
//! ```json
//! {"status":"ok","message":"...","output_path":"/roms/Level 1.smc"}
//! {"status":"error","message":"...","error_kind":"patch_corrupt"}
//! ```
//! `output_path`, `error_kind` and `readme` are omitted when absent. The
//! HTTP status follows the error kind, see [`status_code`].

use anyhow::{Context, Result};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::pipeline::PipelineOutcome;
use crate::source::{self, PatchRequest, PatchSource};

/// Largest request body accepted.
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;
pub const HEALTH_MESSAGE: &str = "ROM Patcher server is running";

/// Body of `POST /patch`. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchBody {
    #[serde(default, alias = "patch_url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Patch bytes, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(default, alias = "level_name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
}

impl WireResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
            output_path: None,
            error_kind: None,
            readme: None,
        }
    }

    pub fn error(err: &PipelineError) -> Self {
        Self {
            status: Status::Error,
            message: err.user_message().to_string(),
            output_path: None,
            error_kind: Some(err.kind().to_string()),
            readme: None,
        }
    }

    pub fn from_outcome(result: &Result<PipelineOutcome, PipelineError>) -> Self {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return Self::error(e),
        };
        let mut response = match &outcome.launch {
            Ok(_) => Self::ok(outcome.summary()),
            Err(e) => Self {
                message: outcome.summary(),
                ..Self::error(e)
            },
        };
        response.output_path = Some(outcome.output.path.clone());
        response.readme = outcome.readme.clone();
        response
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// HTTP status for a failed request.
pub fn status_code(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::UntrustedSource(_) => StatusCode::FORBIDDEN,
        PipelineError::PatchNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::DownloadFailed { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::PatchTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PipelineError::PatchCorrupt(_) | PipelineError::ChecksumMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Status and body answering one `POST /patch`.
pub fn reply(result: &Result<PipelineOutcome, PipelineError>) -> (StatusCode, WireResponse) {
    let status = match result {
        Ok(outcome) => match &outcome.launch {
            Ok(_) => StatusCode::OK,
            Err(e) => status_code(e),
        },
        Err(e) => status_code(e),
    };
    (status, WireResponse::from_outcome(result))
}

fn invalid(reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidRequest(reason.into())
}

/// Decode a `POST /patch` body.
pub fn parse_patch_body(body: &[u8]) -> Result<PatchBody, PipelineError> {
    serde_json::from_slice(body).map_err(|e| invalid(format!("malformed JSON: {e}")))
}

impl PatchBody {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn inline(bytes: &[u8]) -> Self {
        Self {
            hex: Some(hex::encode(bytes)),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Check the body against what the listener accepts and convert it.
    pub fn into_request(self, settings: &Settings) -> Result<PatchRequest, PipelineError> {
        let source = match (self.url, self.path, self.hex) {
            (Some(url), None, None) => {
                if url.trim().is_empty() {
                    return Err(invalid("url is empty"));
                }
                // Syntax and length only; trust is checked by the resolver.
                source::parse_url(&url)?;
                PatchSource::RemoteUrl(url)
            }
            (None, Some(path), None) => {
                if !settings.accept_local_paths {
                    return Err(invalid("local paths are not accepted by this listener"));
                }
                if path.as_os_str().is_empty() {
                    return Err(invalid("path is empty"));
                }
                PatchSource::LocalPath(path)
            }
            (None, None, Some(hex)) => {
                if !settings.accept_inline {
                    return Err(invalid("inline patches are not accepted by this listener"));
                }
                let bytes = hex::decode(hex.trim())
                    .map_err(|e| invalid(format!("inline patch is not valid hex: {e}")))?;
                if bytes.is_empty() {
                    return Err(invalid("inline patch is empty"));
                }
                PatchSource::Inline(bytes)
            }
            (None, None, None) => return Err(invalid("missing patch_url")),
            _ => return Err(invalid("give exactly one of url, path or hex")),
        };
        Ok(PatchRequest {
            source,
            name: self.name.filter(|n| !n.trim().is_empty()),
        })
    }
}

fn local_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .context("Failed to build HTTP client")
}

/// Submit one patch request to a running listener and wait for its answer.
pub async fn send(addr: SocketAddr, body: &PatchBody) -> Result<WireResponse> {
    local_client()?
        .post(format!("http://{addr}/patch"))
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach listener at {addr}"))?
        .json()
        .await
        .context("Listener sent a malformed response")
}

pub async fn health(addr: SocketAddr) -> Result<WireResponse> {
    local_client()?
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .with_context(|| format!("Failed to reach listener at {addr}"))?
        .json()
        .await
        .context("Listener sent a malformed response")
}
