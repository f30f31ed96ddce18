use crate::error::{ApplyError, ChecksumKind};
use crate::patch_format::{Action, BpsPatch};
use crate::util;

/// Largest target a patch may declare. Keeps a hostile header from forcing a
/// huge up-front allocation.
pub const MAX_TARGET_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumCheck {
    pub expected: u32,
    pub actual: u32,
}

impl ChecksumCheck {
    pub fn ok(&self) -> bool {
        self.expected == self.actual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub source: ChecksumCheck,
    pub target: ChecksumCheck,
}

impl Verification {
    pub fn from_trailer(patch: &BpsPatch<'_>, source: &[u8], target: &[u8]) -> Self {
        let (source_crc, target_crc) = rayon::join(|| util::crc32(source), || util::crc32(target));
        Self {
            source: ChecksumCheck {
                expected: patch.source_checksum,
                actual: source_crc,
            },
            target: ChecksumCheck {
                expected: patch.target_checksum,
                actual: target_crc,
            },
        }
    }

    /// First failed check, source before target.
    pub fn failure(&self) -> Option<ApplyError> {
        [
            (ChecksumKind::Source, self.source),
            (ChecksumKind::Target, self.target),
        ]
        .into_iter()
        .find(|(_, check)| !check.ok())
        .map(|(kind, check)| ApplyError::ChecksumMismatch {
            kind,
            expected: check.expected,
            actual: check.actual,
        })
    }
}

/// Patched bytes plus the outcome of checksum verification.
///
/// A failed verification does not discard `data`; callers decide what to do
/// with it, but must go through [`PatchOutput::into_verified`] before saving.
#[derive(Debug, Clone)]
pub struct PatchOutput {
    pub data: Vec<u8>,
    pub verification: Verification,
    pub metadata: Option<String>,
}

impl PatchOutput {
    pub fn is_valid(&self) -> bool {
        self.verification.failure().is_none()
    }

    pub fn into_verified(self) -> Result<Vec<u8>, ApplyError> {
        match self.verification.failure() {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

/// Apply a BPS patch to `source`.
///
/// Decoding errors (bad container, truncated stream, out-of-range copies) are
/// returned as errors. Checksum results are reported in the returned
/// [`PatchOutput`].
pub fn apply_bps(source: &[u8], raw: &[u8]) -> Result<PatchOutput, ApplyError> {
    let patch = BpsPatch::parse(raw)?;

    if patch.source_size != source.len() as u64 {
        tracing::warn!(
            declared = patch.source_size,
            actual = source.len(),
            "base ROM size differs from the size the patch was made for"
        );
    }
    if patch.target_size > MAX_TARGET_SIZE {
        return Err(ApplyError::Corrupt(format!(
            "declared target size {} exceeds {} bytes",
            patch.target_size, MAX_TARGET_SIZE
        )));
    }

    let target_size = patch.target_size as usize;
    let mut target = vec![0u8; target_size];
    let mut output_offset = 0usize;
    let mut source_relative = 0usize;
    let mut target_relative = 0usize;
    let mut instructions = patch.instructions();

    while output_offset < target_size {
        let instruction = match instructions.next() {
            Some(instruction) => instruction?,
            None => {
                return Err(ApplyError::Truncated {
                    expected: patch.target_size,
                    produced: output_offset as u64,
                })
            }
        };

        let remaining = target_size - output_offset;
        let len = usize::try_from(instruction.length)
            .ok()
            .filter(|&len| len <= remaining)
            .ok_or_else(|| {
                ApplyError::Corrupt(format!(
                    "{:?} of {} bytes at {} overruns target of {} bytes",
                    instruction.action, instruction.length, output_offset, target_size
                ))
            })?;
        let dest = output_offset..output_offset + len;

        match instruction.action {
            Action::SourceRead => {
                let src = source_range(source, output_offset, len, &patch)?;
                target[dest].copy_from_slice(src);
            }
            Action::TargetRead => {
                target[dest].copy_from_slice(instruction.literal);
            }
            Action::SourceCopy => {
                source_relative = seek(source_relative, instruction.relative)?;
                let src = source_range(source, source_relative, len, &patch)?;
                target[dest].copy_from_slice(src);
                source_relative += len;
            }
            Action::TargetCopy => {
                target_relative = seek(target_relative, instruction.relative)?;
                if target_relative >= output_offset {
                    return Err(ApplyError::Corrupt(format!(
                        "TargetCopy reads offset {target_relative} before it is written"
                    )));
                }
                // Byte at a time: runs may overlap the bytes they produce.
                for i in 0..len {
                    target[output_offset + i] = target[target_relative + i];
                }
                target_relative += len;
            }
        }
        output_offset += len;
    }

    if instructions.remaining() != 0 {
        return Err(ApplyError::Corrupt(format!(
            "{} bytes of action data left after target was complete",
            instructions.remaining()
        )));
    }

    let verification = Verification::from_trailer(&patch, source, &target);
    Ok(PatchOutput {
        data: target,
        verification,
        metadata: patch.metadata_str().map(str::to_owned),
    })
}

fn seek(cursor: usize, relative: i64) -> Result<usize, ApplyError> {
    let moved = if relative >= 0 {
        usize::try_from(relative)
            .ok()
            .and_then(|delta| cursor.checked_add(delta))
    } else {
        usize::try_from(relative.unsigned_abs())
            .ok()
            .and_then(|delta| cursor.checked_sub(delta))
    };
    moved.ok_or_else(|| {
        ApplyError::Corrupt(format!("relative offset {relative} moves cursor out of range"))
    })
}

/// Slice of the base ROM for a read. A read past the end of a base ROM that
/// is not the size the patch expects means the wrong ROM was supplied.
fn source_range<'s>(
    source: &'s [u8],
    start: usize,
    len: usize,
    patch: &BpsPatch<'_>,
) -> Result<&'s [u8], ApplyError> {
    if let Some(slice) = start
        .checked_add(len)
        .and_then(|end| source.get(start..end))
    {
        return Ok(slice);
    }
    if source.len() as u64 != patch.source_size {
        return Err(ApplyError::ChecksumMismatch {
            kind: ChecksumKind::Source,
            expected: patch.source_checksum,
            actual: util::crc32(source),
        });
    }
    Err(ApplyError::Corrupt(format!(
        "source read of {len} bytes at {start} is past the end of the base ROM"
    )))
}
