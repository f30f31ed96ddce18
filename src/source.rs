//! Turning a [`PatchRequest`] into raw patch bytes.

use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::archive;
use crate::config::Settings;
use crate::error::{PipelineError, Result};

/// User agent string for download requests.
const USER_AGENT_VALUE: &str = concat!("rom-patcher/", env!("CARGO_PKG_VERSION"));
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_RETRIES: u32 = 2;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSource {
    Inline(Vec<u8>),
    LocalPath(PathBuf),
    RemoteUrl(String),
}

impl PatchSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inline(_) => "inline",
            Self::LocalPath(_) => "path",
            Self::RemoteUrl(_) => "url",
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Inline(bytes) => format!("{} inline bytes", bytes.len()),
            Self::LocalPath(path) => path.display().to_string(),
            Self::RemoteUrl(url) => url.clone(),
        }
    }
}

/// One unit of work: fetch, apply, save, launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub source: PatchSource,
    /// Suggested output file name, sanitized by the writer.
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct ResolvedPatch {
    pub bytes: Vec<u8>,
    pub readme: Option<String>,
}

/// Trusted origins for remote patches.
#[derive(Debug, Clone)]
pub struct AllowList {
    hosts: Vec<String>,
    schemes: Vec<String>,
}

impl AllowList {
    pub fn new<H, S>(hosts: H, schemes: S) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let normalize = |s: &str| s.trim().trim_end_matches('.').to_ascii_lowercase();
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| normalize(h.as_ref()))
                .filter(|h| !h.is_empty())
                .collect(),
            schemes: schemes
                .into_iter()
                .map(|s| normalize(s.as_ref()))
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.trusted_hosts, &settings.trusted_schemes)
    }

    /// A host matches an entry exactly or as a subdomain of it.
    pub fn permits(&self, url: &Url) -> bool {
        if !self.schemes.iter().any(|s| s == url.scheme()) {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.hosts.iter().any(|trusted| {
            host == *trusted
                || host
                    .strip_suffix(trusted.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Whether a browser `Origin` header value names a trusted site.
    pub fn permits_origin(&self, origin: &str) -> bool {
        Url::parse(origin).is_ok_and(|url| self.permits(&url))
    }

    pub fn check(&self, url: &Url) -> Result<()> {
        if self.permits(url) {
            Ok(())
        } else {
            Err(PipelineError::UntrustedSource(format!(
                "{} is not an allowed origin",
                url.origin().ascii_serialization()
            )))
        }
    }
}

/// Parse and validate a remote patch URL without touching the network.
pub fn parse_url(raw: &str) -> Result<Url> {
    if raw.len() > MAX_URL_LEN {
        return Err(PipelineError::InvalidRequest(format!(
            "URL is longer than {MAX_URL_LEN} characters"
        )));
    }
    Url::parse(raw).map_err(|e| PipelineError::InvalidRequest(format!("bad URL {raw:?}: {e}")))
}

/// HTTP client with a size ceiling, bounded retries and allow-listed redirects.
pub struct Downloader {
    client: reqwest::Client,
    allow: Arc<AllowList>,
    max_bytes: u64,
    retries: u32,
    backoff: Duration,
}

impl Downloader {
    pub fn new(allow: AllowList, timeout: Duration, max_bytes: u64) -> Result<Self> {
        let allow = Arc::new(allow);
        let redirect_allow = Arc::clone(&allow);
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if redirect_allow.permits(attempt.url()) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT_VALUE)
            .timeout(timeout)
            .redirect(policy)
            .build()
            .map_err(|e| PipelineError::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            allow,
            max_bytes,
            retries: MAX_RETRIES,
            backoff: RETRY_BACKOFF,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            AllowList::from_settings(settings),
            settings.download_timeout(),
            settings.max_patch_bytes,
        )
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Download `url`. The allow-list is checked before any connection is made.
    /// Failures marked retryable are tried again with doubling delays.
    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        self.allow.check(url)?;

        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let delay = self.backoff * 2u32.pow(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        "download of {url} failed ({e}); retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(PipelineError::DownloadFailed { reason, transient }) if transient => {
                    return Err(PipelineError::DownloadFailed {
                        reason: format!("{reason} (gave up after {} attempts)", attempt + 1),
                        transient,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PipelineError::DownloadFailed {
                reason: e.to_string(),
                transient: !e.is_builder(),
            })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<unknown>")
                .to_string();
            return Err(PipelineError::UntrustedSource(format!(
                "redirected to {location}"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::DownloadFailed {
                reason: format!("server answered HTTP {status}"),
                transient: is_transient_status(status),
            });
        }

        let too_large = || PipelineError::PatchTooLarge {
            limit: self.max_bytes,
        };
        let declared = response.content_length();
        if declared.is_some_and(|len| len > self.max_bytes) {
            return Err(too_large());
        }

        let mut data = Vec::with_capacity(declared.unwrap_or(0).min(self.max_bytes) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::DownloadFailed {
                reason: e.to_string(),
                transient: true,
            })?;
            if (data.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large());
            }
            data.extend_from_slice(&chunk);
        }

        tracing::debug!("downloaded {} from {url}", crate::util::format_bytes(data.len() as u64));
        Ok(data)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Fetch the bytes named by `request` and unpack them if they are an archive.
pub async fn resolve(request: &PatchRequest, settings: &Settings) -> Result<ResolvedPatch> {
    let max_bytes = settings.max_patch_bytes;
    let bytes = match &request.source {
        PatchSource::Inline(bytes) => {
            if bytes.len() as u64 > max_bytes {
                return Err(PipelineError::PatchTooLarge { limit: max_bytes });
            }
            bytes.clone()
        }
        PatchSource::LocalPath(path) => {
            let meta = tokio::fs::metadata(path).await.map_err(|e| {
                PipelineError::PatchNotFound(format!("{}: {e}", path.display()))
            })?;
            if !meta.is_file() {
                return Err(PipelineError::PatchNotFound(format!(
                    "{} is not a file",
                    path.display()
                )));
            }
            if meta.len() > max_bytes {
                return Err(PipelineError::PatchTooLarge { limit: max_bytes });
            }
            tokio::fs::read(path).await.map_err(|e| {
                PipelineError::PatchNotFound(format!("{}: {e}", path.display()))
            })?
        }
        PatchSource::RemoteUrl(raw) => {
            let url = parse_url(raw)?;
            // Check before building a client so an untrusted URL costs nothing.
            AllowList::from_settings(settings).check(&url)?;
            Downloader::from_settings(settings)?.fetch(&url).await?
        }
    };

    let Some(format) = archive::ArchiveFormat::detect(&bytes) else {
        return Ok(ResolvedPatch {
            bytes,
            readme: None,
        });
    };
    let unpacked = tokio::task::spawn_blocking(move || archive::extract_patch(format, &bytes, max_bytes))
        .await
        .map_err(|e| PipelineError::Internal(format!("archive task failed: {e}")))??;
    tracing::info!("using {} from {format} archive", unpacked.patch_name);
    Ok(ResolvedPatch {
        bytes: unpacked.patch,
        readme: unpacked.readme,
    })
}
