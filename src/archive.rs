//! Patches distributed as ZIP or 7z archives.

use std::fmt;
use std::io::{Cursor, Read};

use crate::error::PipelineError;

pub const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
pub const SEVEN_ZIP_MAGIC: &[u8; 6] = b"7z\xBC\xAF\x27\x1C";
const MAX_README_BYTES: u64 = 64 * 1024;
/// Skipped 7z entries still have to be decompressed; their declared sizes
/// together may not exceed this multiple of the patch limit.
const MAX_SOLID_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZip,
}

impl ArchiveFormat {
    /// Recognize an archive by its leading magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            Some(Self::Zip)
        } else if bytes.starts_with(SEVEN_ZIP_MAGIC) {
            Some(Self::SevenZip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => f.write_str("ZIP"),
            Self::SevenZip => f.write_str("7z"),
        }
    }
}

#[derive(Debug)]
pub struct Unpacked {
    pub patch: Vec<u8>,
    /// Entry name inside the archive.
    pub patch_name: String,
    pub readme: Option<String>,
}

fn file_name(entry: &str) -> &str {
    entry.rsplit(['/', '\\']).next().unwrap_or(entry)
}

fn is_patch(entry: &str) -> bool {
    file_name(entry).to_ascii_lowercase().ends_with(".bps")
}

fn is_readme(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    if !lower.starts_with("readme") {
        return false;
    }
    match lower.rsplit_once('.') {
        None => true,
        Some((_, ext)) => matches!(ext, "txt" | "md" | "text"),
    }
}

/// Entries to pull out of an archive: the first `.bps` by name and the
/// first README in archive order.
struct Selection {
    patch: String,
    readme: Option<String>,
}

fn select<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Selection, PipelineError> {
    let mut patches = Vec::new();
    let mut readme = None;
    for name in entries {
        if is_patch(name) {
            patches.push(name);
        } else if readme.is_none() && is_readme(file_name(name)) {
            readme = Some(name.to_string());
        }
    }

    patches.sort_unstable();
    let patch = patches
        .first()
        .map(|name| name.to_string())
        .ok_or_else(|| PipelineError::PatchNotFound("archive contains no .bps file".to_string()))?;
    if patches.len() > 1 {
        tracing::warn!(
            count = patches.len(),
            using = %patch,
            "archive contains several patches; applying the first"
        );
    }
    Ok(Selection { patch, readme })
}

/// Pull the first `.bps` entry (by name) and any README out of an archive.
/// Entries larger than `max_bytes` once inflated are refused.
pub fn extract_patch(
    format: ArchiveFormat,
    bytes: &[u8],
    max_bytes: u64,
) -> Result<Unpacked, PipelineError> {
    match format {
        ArchiveFormat::Zip => extract_zip(bytes, max_bytes),
        ArchiveFormat::SevenZip => extract_7z(bytes, max_bytes),
    }
}

fn read_capped(
    reader: impl Read,
    max_bytes: u64,
    name: &str,
) -> Result<Vec<u8>, PipelineError> {
    let mut data = Vec::new();
    reader
        .take(max_bytes + 1)
        .read_to_end(&mut data)
        .map_err(|e| PipelineError::PatchCorrupt(format!("cannot inflate {name}: {e}")))?;
    if data.len() as u64 > max_bytes {
        return Err(PipelineError::PatchTooLarge { limit: max_bytes });
    }
    Ok(data)
}

fn read_readme(reader: impl Read) -> Option<String> {
    let mut raw = Vec::new();
    reader
        .take(MAX_README_BYTES)
        .read_to_end(&mut raw)
        .ok()
        .map(|_| String::from_utf8_lossy(&raw).into_owned())
}

fn zip_error(e: zip::result::ZipError) -> PipelineError {
    PipelineError::PatchCorrupt(format!("unreadable ZIP archive: {e}"))
}

fn extract_zip(bytes: &[u8], max_bytes: u64) -> Result<Unpacked, PipelineError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;

    let mut names = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_error)?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    let selection = select(names.iter().map(String::as_str))?;

    let patch = read_capped(
        archive.by_name(&selection.patch).map_err(zip_error)?,
        max_bytes,
        &selection.patch,
    )?;
    let readme = match &selection.readme {
        Some(name) => read_readme(archive.by_name(name).map_err(zip_error)?),
        None => None,
    };

    Ok(Unpacked {
        patch,
        patch_name: selection.patch,
        readme,
    })
}

fn seven_zip_error(e: sevenz_rust::Error) -> PipelineError {
    PipelineError::PatchCorrupt(format!("unreadable 7z archive: {e}"))
}

fn extract_7z(bytes: &[u8], max_bytes: u64) -> Result<Unpacked, PipelineError> {
    let mut archive = sevenz_rust::SevenZReader::new(
        Cursor::new(bytes),
        bytes.len() as u64,
        sevenz_rust::Password::empty(),
    )
    .map_err(seven_zip_error)?;

    let files: Vec<(String, u64)> = archive
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .map(|entry| (entry.name().to_string(), entry.size()))
        .collect();
    let selection = select(files.iter().map(|(name, _)| name.as_str()))?;
    let declared: u64 = files.iter().map(|(_, size)| *size).sum();
    if files
        .iter()
        .any(|(name, size)| *name == selection.patch && *size > max_bytes)
        || declared > max_bytes.saturating_mul(MAX_SOLID_FACTOR)
    {
        return Err(PipelineError::PatchTooLarge { limit: max_bytes });
    }

    let mut patch = None;
    let mut readme = None;
    let mut failure = None;
    archive
        .for_each_entries(|entry, data| {
            let name = entry.name();
            if name == selection.patch {
                match read_capped(&mut *data, max_bytes, name) {
                    Ok(bytes) => patch = Some(bytes),
                    Err(e) => {
                        failure = Some(e);
                        return Ok(false);
                    }
                }
            } else if selection.readme.as_deref() == Some(name) {
                readme = read_readme(&mut *data);
            }
            if patch.is_some() && (selection.readme.is_none() || readme.is_some()) {
                return Ok(false);
            }
            // Solid blocks decode sequentially; drain what was skipped.
            if let Err(e) = std::io::copy(data, &mut std::io::sink()) {
                failure = Some(PipelineError::PatchCorrupt(format!("cannot inflate {name}: {e}")));
                return Ok(false);
            }
            Ok(true)
        })
        .map_err(seven_zip_error)?;

    if let Some(e) = failure {
        return Err(e);
    }
    let patch = patch.ok_or_else(|| {
        PipelineError::PatchCorrupt(format!("7z entry {} has no data", selection.patch))
    })?;
    Ok(Unpacked {
        patch,
        patch_name: selection.patch,
        readme,
    })
}
