use std::path::Path;
use std::process::Stdio;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Started { pid: Option<u32> },
    /// Not an error: the ROM was saved, there is just nothing to open it with.
    NoEmulatorConfigured,
}

/// Start `emulator` with `rom` as its only argument and return without
/// waiting for it. Only a failure to spawn is reported.
pub fn launch(rom: &Path, emulator: Option<&Path>) -> Result<LaunchStatus> {
    let Some(emulator) = emulator else {
        return Ok(LaunchStatus::NoEmulatorConfigured);
    };
    let failed = |reason: String| PipelineError::LaunchFailed {
        path: emulator.to_path_buf(),
        reason,
    };

    if !emulator.is_file() {
        return Err(failed("emulator executable does not exist".to_string()));
    }
    let rom = rom
        .canonicalize()
        .map_err(|e| failed(format!("cannot resolve ROM path {}: {e}", rom.display())))?;

    // tokio reaps the child in the background once the handle is dropped.
    let child = tokio::process::Command::new(emulator)
        .arg(&rom)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    let pid = child.id();
    tracing::info!(pid, "launched {} {}", emulator.display(), rom.display());
    Ok(LaunchStatus::Started { pid })
}
