use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binary_patch::{self, PatchOutput, Verification, MAX_TARGET_SIZE};
use crate::config::{ApplierKind, Settings};
use crate::error::{ApplyError, PipelineError};
use crate::patch_format::BpsPatch;

/// How long an external patch tool may run before it is killed.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a base ROM and a BPS patch into a [`PatchOutput`].
///
/// Every implementation reports container damage as [`ApplyError::Corrupt`]
/// and fills in [`Verification`] from the patch trailer, so callers treat
/// them interchangeably.
pub trait PatchApplier: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<PatchOutput, ApplyError>;
}

/// In-process BPS decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinApplier;

impl PatchApplier for BuiltinApplier {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<PatchOutput, ApplyError> {
        binary_patch::apply_bps(base, patch)
    }
}

/// Runs a flips-compatible executable:
/// `<program> --apply <patch> <base> <output>`.
#[derive(Debug, Clone)]
pub struct ExternalToolApplier {
    program: PathBuf,
    timeout: Duration,
}

impl ExternalToolApplier {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            timeout: TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl PatchApplier for ExternalToolApplier {
    fn name(&self) -> &'static str {
        "external"
    }

    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<PatchOutput, ApplyError> {
        // Reject damaged containers before involving the tool.
        let header = BpsPatch::parse(patch)?;
        if header.target_size > MAX_TARGET_SIZE {
            return Err(ApplyError::Corrupt(format!(
                "declared target size {} exceeds {} bytes",
                header.target_size, MAX_TARGET_SIZE
            )));
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| ApplyError::Tool(format!("cannot create scratch directory: {e}")))?;
        let base_path = scratch.path().join("base.rom");
        let patch_path = scratch.path().join("patch.bps");
        let output_path = scratch.path().join("output.rom");
        let log_path = scratch.path().join("tool.log");

        std::fs::write(&base_path, base)
            .and_then(|()| std::fs::write(&patch_path, patch))
            .map_err(|e| ApplyError::Tool(format!("cannot stage input files: {e}")))?;
        let log = File::create(&log_path)
            .map_err(|e| ApplyError::Tool(format!("cannot create tool log: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| ApplyError::Tool(format!("cannot create tool log: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--apply")
            .arg(&patch_path)
            .arg(&base_path)
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);

        let status = run_with_timeout(&mut cmd, &self.program, self.timeout)?;

        // flips can exit non-zero after writing output (e.g. on a checksum
        // warning); the trailer check below decides validity.
        let data = match std::fs::read(&output_path) {
            Ok(data) => data,
            Err(_) => {
                let log = std::fs::read_to_string(&log_path).unwrap_or_default();
                return Err(ApplyError::Tool(format!(
                    "{} exited with {status} and wrote no output: {}",
                    self.program.display(),
                    log.trim()
                )));
            }
        };
        if !status.success() {
            tracing::warn!(%status, tool = %self.program.display(), "patch tool reported failure but produced output");
        }

        let verification = Verification::from_trailer(&header, base, &data);
        Ok(PatchOutput {
            data,
            verification,
            metadata: header.metadata_str().map(str::to_owned),
        })
    }
}

fn run_with_timeout(
    cmd: &mut Command,
    program: &Path,
    timeout: Duration,
) -> Result<std::process::ExitStatus, ApplyError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| ApplyError::Tool(format!("cannot start {}: {e}", program.display())))?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ApplyError::Tool(format!(
                    "{} timed out after {}s",
                    program.display(),
                    timeout.as_secs()
                )));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                return Err(ApplyError::Tool(format!(
                    "cannot wait for {}: {e}",
                    program.display()
                )))
            }
        }
    }
}

/// Select the applier named by the settings.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn PatchApplier>, PipelineError> {
    match settings.applier {
        ApplierKind::Builtin => Ok(Arc::new(BuiltinApplier)),
        ApplierKind::External => {
            let program = settings
                .patch_tool
                .clone()
                .ok_or(PipelineError::NotConfigured("patch_tool is not set"))?;
            Ok(Arc::new(ExternalToolApplier::new(program)))
        }
    }
}
