//! Failure taxonomy for the patch-request pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Which trailer checksum failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Source,
    Target,
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Errors produced while decoding or applying a BPS patch.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("patch is corrupt: {0}")]
    Corrupt(String),

    #[error("patch ends before producing {expected} bytes (stopped at {produced})")]
    Truncated { expected: u64, produced: u64 },

    #[error("{kind} checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        kind: ChecksumKind,
        expected: u32,
        actual: u32,
    },

    #[error("external patch tool failed: {0}")]
    Tool(String),
}

/// Every way a patch request can fail.
///
/// The listener is the only place these are turned into responses; every
/// pipeline stage returns one of them instead of panicking.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("untrusted patch source: {0}")]
    UntrustedSource(String),

    #[error("patch not found: {0}")]
    PatchNotFound(String),

    /// `transient` marks failures a later attempt may not hit again:
    /// dropped connections, timeouts and 429/502/503/504 answers.
    #[error("download failed: {reason}")]
    DownloadFailed { reason: String, transient: bool },

    #[error("patch exceeds the {limit} byte limit")]
    PatchTooLarge { limit: u64 },

    #[error("patch is corrupt: {0}")]
    PatchCorrupt(String),

    #[error("{kind} checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        kind: ChecksumKind,
        expected: u32,
        actual: u32,
    },

    #[error("patch tool failed: {0}")]
    PatchToolFailed(String),

    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    #[error("cannot read base ROM {path}: {reason}")]
    BaseRomUnreadable { path: PathBuf, reason: String },

    #[error("failed to write output ROM {path}: {reason}")]
    OutputWriteFailed { path: PathBuf, reason: String },

    #[error("failed to launch emulator {path}: {reason}")]
    LaunchFailed { path: PathBuf, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable identifier used on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UntrustedSource(_) => "untrusted_source",
            Self::PatchNotFound(_) => "patch_not_found",
            Self::DownloadFailed { .. } => "download_failed",
            Self::PatchTooLarge { .. } => "patch_too_large",
            Self::PatchCorrupt(_) => "patch_corrupt",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::PatchToolFailed(_) => "patch_tool_failed",
            Self::NotConfigured(_) => "not_configured",
            Self::BaseRomUnreadable { .. } => "base_rom_unreadable",
            Self::OutputWriteFailed { .. } => "output_write_failed",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns a user-facing message that says what to do about the failure.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "The patch request was malformed and was ignored.",
            Self::UntrustedSource(_) => {
                "The patch comes from a site that is not on the trusted list. Add it to trusted_hosts if you trust it."
            }
            Self::PatchNotFound(_) => "The patch file could not be found.",
            Self::DownloadFailed { .. } => {
                "Could not reach the download server. Check your internet connection and try again."
            }
            Self::PatchTooLarge { .. } => "The patch file is too large to be a valid ROM patch.",
            Self::PatchCorrupt(_) => "The patch file is corrupted or is not a BPS patch.",
            Self::ChecksumMismatch {
                kind: ChecksumKind::Source,
                ..
            } => "Your base ROM does not match the one this patch was made for. Check that it is an unheadered copy of the right game and region.",
            Self::ChecksumMismatch {
                kind: ChecksumKind::Target,
                ..
            } => "The patched ROM failed verification. The patch may be damaged; nothing was saved.",
            Self::PatchToolFailed(_) => {
                "The external patch tool failed. Check the patch_tool setting or switch to the built-in applier."
            }
            Self::NotConfigured(_) => "Select a base ROM and an output folder in the settings first.",
            Self::BaseRomUnreadable { .. } => "The base ROM file could not be read. Check the base_rom setting.",
            Self::OutputWriteFailed { .. } => {
                "Could not save the patched ROM. Check that the output folder is writable and the disk is not full."
            }
            Self::LaunchFailed { .. } => {
                "The ROM was saved, but the emulator could not be started. Check the emulator setting."
            }
            Self::Internal(_) => "An unexpected error occurred while handling the request.",
        }
    }

    /// Whether retrying the same network fetch may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed {
                transient: true,
                ..
            }
        )
    }
}

impl From<ApplyError> for PipelineError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Corrupt(reason) => Self::PatchCorrupt(reason),
            e @ ApplyError::Truncated { .. } => Self::PatchCorrupt(e.to_string()),
            ApplyError::ChecksumMismatch {
                kind,
                expected,
                actual,
            } => Self::ChecksumMismatch {
                kind,
                expected,
                actual,
            },
            ApplyError::Tool(reason) => Self::PatchToolFailed(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
