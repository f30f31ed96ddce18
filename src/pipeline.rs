//! One patch request from intake to emulator launch.

use std::sync::Arc;
use std::time::Instant;

use crate::apply;
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, PipelineEvent, Stage};
use crate::launcher::{self, LaunchStatus};
use crate::source::{self, PatchRequest};
use crate::util;
use crate::writer::{self, WrittenRom};

#[derive(Debug)]
pub struct PipelineOutcome {
    pub output: WrittenRom,
    /// Launch runs after the ROM is safely on disk, so its failure does not
    /// undo the write.
    pub launch: Result<LaunchStatus>,
    pub readme: Option<String>,
    pub metadata: Option<String>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.launch.is_ok()
    }

    pub fn summary(&self) -> String {
        let path = self.output.path.display();
        match &self.launch {
            Ok(LaunchStatus::Started { .. }) => format!("Patched ROM saved to {path} and launched"),
            Ok(LaunchStatus::NoEmulatorConfigured) => {
                format!("Patched ROM saved to {path} (no emulator configured)")
            }
            Err(e) => format!("Patched ROM saved to {path}, but the emulator could not be started: {e}"),
        }
    }
}

struct Progress<'a> {
    request_id: u64,
    events: &'a dyn EventSink,
}

impl Progress<'_> {
    fn enter(&self, stage: Stage) {
        self.events.emit(PipelineEvent::StageChanged {
            request_id: self.request_id,
            stage,
        });
    }

    fn fail(&self, err: &PipelineError) {
        self.enter(Stage::Failed {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// Run every stage for `request` against one settings snapshot. Each stage
/// transition and the final outcome are reported to `events`.
pub async fn run(
    request_id: u64,
    request: PatchRequest,
    settings: Arc<Settings>,
    events: &dyn EventSink,
) -> Result<PipelineOutcome> {
    let progress = Progress { request_id, events };
    let start = Instant::now();
    progress.enter(Stage::Received);
    tracing::info!(request_id, source = %request.source.describe(), "patch request");

    let result = run_stages(&request, &settings, &progress).await;

    let (ok, message, output_path) = match &result {
        Ok(outcome) => {
            match &outcome.launch {
                Ok(_) => progress.enter(Stage::Completed),
                Err(e) => progress.fail(e),
            }
            (
                outcome.is_success(),
                outcome.summary(),
                Some(outcome.output.path.clone()),
            )
        }
        Err(e) => {
            progress.fail(e);
            (false, e.user_message().to_string(), None)
        }
    };
    tracing::debug!(request_id, elapsed = ?start.elapsed(), ok, "pipeline finished");
    events.emit(PipelineEvent::Finished {
        request_id,
        ok,
        message,
        output_path,
    });
    result
}

async fn run_stages(
    request: &PatchRequest,
    settings: &Settings,
    progress: &Progress<'_>,
) -> Result<PipelineOutcome> {
    // Configuration problems are reported before anything is fetched.
    let base_path = settings.base_rom()?.to_path_buf();
    let output_dir = settings.output_dir()?.to_path_buf();
    let applier = apply::from_settings(settings)?;

    progress.enter(Stage::Resolving);
    let resolved = source::resolve(request, settings).await?;

    progress.enter(Stage::Applying);
    let base = tokio::fs::read(&base_path)
        .await
        .map_err(|e| PipelineError::BaseRomUnreadable {
            path: base_path.clone(),
            reason: e.to_string(),
        })?;
    if base.is_empty() {
        return Err(PipelineError::BaseRomUnreadable {
            path: base_path,
            reason: "file is empty".to_string(),
        });
    }
    let patch = resolved.bytes;
    let applier_name = applier.name();
    let output = tokio::task::spawn_blocking(move || applier.apply(&base, &patch))
        .await
        .map_err(|e| PipelineError::Internal(format!("patch task failed: {e}")))??;
    let metadata = output.metadata.clone();
    let data = output.into_verified()?;
    tracing::info!(
        applier = applier_name,
        "patched ROM is {} ({})",
        util::format_bytes(data.len() as u64),
        util::fingerprint(&data)
    );

    progress.enter(Stage::Writing);
    let written = writer::write_rom(
        data,
        request.name.as_deref(),
        &output_dir,
        &settings.rom_extension(),
    )
    .await?;
    tracing::info!("saved {}", written.path.display());

    progress.enter(Stage::Launching);
    let launch = launcher::launch(&written.path, settings.emulator());

    Ok(PipelineOutcome {
        output: written,
        launch,
        readme: resolved.readme,
        metadata,
    })
}
