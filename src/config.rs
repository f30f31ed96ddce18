//! Settings (`<config dir>/config.toml`).
//!
//! The file is read at startup and again before every pipeline run, so edits
//! take effect without a restart. Each run works on its own immutable
//! [`Settings`] snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::PipelineError;

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_MAX_PATCH_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_ROM_EXTENSION: &str = "smc";

/// Which [`crate::apply::PatchApplier`] implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplierKind {
    #[default]
    Builtin,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Unmodified ROM every patch is applied to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_rom: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulator: Option<PathBuf>,
    pub launch_emulator: bool,
    pub applier: ApplierKind,
    /// flips-compatible executable, used when `applier = "external"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_tool: Option<PathBuf>,
    pub port: u16,
    /// Hosts allowed to serve remote patches. Subdomains are included.
    pub trusted_hosts: Vec<String>,
    pub trusted_schemes: Vec<String>,
    /// Let listener requests name files on this machine.
    pub accept_local_paths: bool,
    pub accept_inline: bool,
    pub max_patch_bytes: u64,
    pub download_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_rom: None,
            output_dir: None,
            emulator: None,
            launch_emulator: true,
            applier: ApplierKind::Builtin,
            patch_tool: None,
            port: DEFAULT_PORT,
            trusted_hosts: vec!["smwtrolls.com".to_string()],
            trusted_schemes: vec!["https".to_string()],
            accept_local_paths: false,
            accept_inline: true,
            max_patch_bytes: DEFAULT_MAX_PATCH_BYTES,
            download_timeout_secs: 15,
            max_concurrent_requests: 4,
        }
    }
}

impl Settings {
    pub fn base_rom(&self) -> Result<&Path, PipelineError> {
        self.base_rom
            .as_deref()
            .ok_or(PipelineError::NotConfigured("base ROM is not set"))
    }

    pub fn output_dir(&self) -> Result<&Path, PipelineError> {
        self.output_dir
            .as_deref()
            .ok_or(PipelineError::NotConfigured("output folder is not set"))
    }

    /// Emulator to launch after a successful write, if launching is enabled.
    pub fn emulator(&self) -> Option<&Path> {
        self.emulator.as_deref().filter(|_| self.launch_emulator)
    }

    /// Extension for patched ROMs: the base ROM's own, or `smc`.
    pub fn rom_extension(&self) -> String {
        self.base_rom
            .as_deref()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_ROM_EXTENSION.to_string())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }
}

pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "smwtrolls", "rom-patcher")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default settings file location, falling back to the working directory.
pub fn default_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<Settings> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => {
            return Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to read settings: {}", path.display()))
        }
    };
    toml::from_str(&content).with_context(|| format!("Failed to parse settings: {}", path.display()))
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let content = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write settings: {}", path.display()))
}

/// Source of the settings snapshot for each pipeline run.
pub trait SettingsProvider: Send + Sync {
    /// Fresh settings for a new run. May block on file I/O.
    fn snapshot(&self) -> Arc<Settings>;

    /// The last snapshot taken, without touching the disk.
    fn latest(&self) -> Arc<Settings>;
}

/// Settings that never change. Used by one-shot CLI runs and tests.
#[derive(Debug, Clone)]
pub struct FixedSettings(Arc<Settings>);

impl FixedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(settings))
    }
}

impl SettingsProvider for FixedSettings {
    fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.0)
    }

    fn latest(&self) -> Arc<Settings> {
        Arc::clone(&self.0)
    }
}

/// Re-reads the settings file on every snapshot. If the file becomes
/// unreadable, the settings loaded at startup are used.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    initial: Arc<Settings>,
    latest: RwLock<Arc<Settings>>,
}

impl FileSettings {
    pub fn open(path: PathBuf) -> Result<Self> {
        let initial = Arc::new(load_from(&path)?);
        Ok(Self {
            path,
            latest: RwLock::new(Arc::clone(&initial)),
            initial,
        })
    }

    pub fn initial(&self) -> &Settings {
        &self.initial
    }
}

impl SettingsProvider for FileSettings {
    fn snapshot(&self) -> Arc<Settings> {
        let settings = match load_from(&self.path) {
            Ok(settings) => Arc::new(settings),
            Err(e) => {
                tracing::warn!("{e:#}; using settings from startup");
                Arc::clone(&self.initial)
            }
        };
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *latest = Arc::clone(&settings);
        settings
    }

    fn latest(&self) -> Arc<Settings> {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&latest)
    }
}
