//! Saving patched ROMs.
//!
//! Data is written to a temporary file in the output folder and renamed over
//! the final name, so the final path is either absent, the previous file, or
//! the complete new ROM. Requests without a usable name get a timestamped
//! name that never replaces an existing file.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tempfile::NamedTempFile;

use crate::error::{PipelineError, Result};
use crate::util;

pub const MAX_NAME_LEN: usize = 100;
/// Suffixes tried after the generated name itself is taken.
const MAX_UNIQUE_ATTEMPTS: u32 = 1000;

/// Device names Windows refuses as file stems, whatever the extension.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRom {
    pub path: PathBuf,
    pub size: u64,
    /// Short BLAKE3 fingerprint of the contents.
    pub fingerprint: String,
}

/// Reduce a display name to a safe file stem: letters, digits, space, `-`,
/// `_` and `.` survive, leading dots are dropped. Windows device names get
/// a `_` prefix. `None` if nothing is left.
pub fn sanitize_name(name: &str) -> Option<String> {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect();
    let trimmed = kept.trim().trim_start_matches('.');
    let truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    let cleaned = truncated.trim_end_matches(['.', ' ']).to_string();
    if cleaned.is_empty() {
        None
    } else if is_reserved(&cleaned) {
        Some(format!("_{cleaned}"))
    } else {
        Some(cleaned)
    }
}

/// `NUL.smc` and `com1 .txt` are as reserved as `NUL` itself.
fn is_reserved(stem: &str) -> bool {
    let device = stem.split('.').next().unwrap_or(stem).trim_end();
    RESERVED_STEMS
        .iter()
        .any(|reserved| device.eq_ignore_ascii_case(reserved))
}

pub fn fallback_name(now: DateTime<Local>) -> String {
    now.format("patched-%Y%m%d-%H%M%S-%3f").to_string()
}

/// Output file name for one request, with the rule for existing files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    stem: String,
    /// Extension with its dot, in the case the name already carried.
    suffix: String,
    generated: bool,
}

impl OutputName {
    /// Name for a ROM with the given display name. A missing or unusable name
    /// falls back to a timestamp.
    pub fn new(name: Option<&str>, extension: &str) -> Self {
        let (stem, generated) = match name.and_then(sanitize_name) {
            Some(stem) => (stem, false),
            None => (fallback_name(Local::now()), true),
        };
        let suffix = format!(".{extension}");
        let lower = stem.to_ascii_lowercase();
        if stem.len() > suffix.len() && lower.ends_with(&suffix.to_ascii_lowercase()) {
            let split = stem.len() - suffix.len();
            Self {
                suffix: stem[split..].to_string(),
                stem: stem[..split].to_string(),
                generated,
            }
        } else {
            Self {
                stem,
                suffix,
                generated,
            }
        }
    }

    /// Generated names must not replace earlier output; named requests
    /// replace their previous ROM.
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// `attempt` 0 is the plain name; later attempts add `-1`, `-2`, ...
    pub fn file_name(&self, attempt: u32) -> String {
        if attempt == 0 {
            format!("{}{}", self.stem, self.suffix)
        } else {
            format!("{}-{attempt}{}", self.stem, self.suffix)
        }
    }
}

/// Fully written temporary file, not yet visible under its final name.
/// Dropping it without [`StagedRom::commit`] deletes the temporary file.
#[derive(Debug)]
pub struct StagedRom {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedRom {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically rename into place, replacing any existing file.
    pub fn commit(self) -> std::io::Result<PathBuf> {
        self.temp.persist(&self.dest).map_err(|e| e.error)?;
        Ok(self.dest)
    }

    /// Move into place under the first free candidate of `name`. Existing
    /// files are never replaced, even by a concurrent writer.
    pub fn commit_unique(self, name: &OutputName) -> std::io::Result<PathBuf> {
        let dir = self
            .dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut temp = self.temp;
        for attempt in 0..MAX_UNIQUE_ATTEMPTS {
            let dest = dir.join(name.file_name(attempt));
            match temp.persist_noclobber(&dest) {
                Ok(_) => return Ok(dest),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => temp = e.file,
                Err(e) => return Err(e.error),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free name for {}", name.file_name(0)),
        ))
    }
}

/// Write `data` to a synced temporary file next to `dir/file_name`.
pub fn stage(dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<StagedRom> {
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".part")
        .tempfile_in(dir)?;
    temp.write_all(data)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    Ok(StagedRom {
        temp,
        dest: dir.join(file_name),
    })
}

/// Save a patched ROM into `output_dir`.
pub async fn write_rom(
    data: Vec<u8>,
    name: Option<&str>,
    output_dir: &Path,
    extension: &str,
) -> Result<WrittenRom> {
    let output = OutputName::new(name, extension);
    let file_name = output.file_name(0);
    let dir = output_dir.to_path_buf();
    let dest = dir.join(&file_name);

    let written = tokio::task::spawn_blocking(move || -> std::io::Result<WrittenRom> {
        let staged = stage(&dir, &file_name, &data)?;
        let path = if output.is_generated() {
            staged.commit_unique(&output)?
        } else {
            staged.commit()?
        };
        Ok(WrittenRom {
            path,
            size: data.len() as u64,
            fingerprint: util::fingerprint(&data),
        })
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("write task failed: {e}")))?;

    written.map_err(|e| PipelineError::OutputWriteFailed {
        path: dest,
        reason: e.to_string(),
    })
}
