//! Observable status of the listener and of each pipeline run.

use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

/// Per-request pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Received,
    Resolving,
    Applying,
    Writing,
    Launching,
    Completed,
    Failed { kind: &'static str, message: String },
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => f.write_str("received"),
            Self::Resolving => f.write_str("resolving"),
            Self::Applying => f.write_str("applying"),
            Self::Writing => f.write_str("writing"),
            Self::Launching => f.write_str("launching"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { kind, .. } => write!(f, "failed ({kind})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    ListenerStarted {
        addr: SocketAddr,
    },
    ListenerStopped,
    StageChanged {
        request_id: u64,
        stage: Stage,
    },
    /// Emitted once per request after its last stage.
    Finished {
        request_id: u64,
        ok: bool,
        message: String,
        output_path: Option<PathBuf>,
    },
}

/// Receives pipeline events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::ListenerStarted { addr } => {
                tracing::info!("Listening for patch requests on {addr}")
            }
            PipelineEvent::ListenerStopped => tracing::info!("Listener stopped"),
            PipelineEvent::StageChanged {
                request_id,
                stage: Stage::Failed { kind, message },
            } => tracing::warn!(request_id, kind, "{message}"),
            PipelineEvent::StageChanged { request_id, stage } => {
                tracing::debug!(request_id, %stage, "stage")
            }
            PipelineEvent::Finished {
                request_id,
                ok,
                message,
                ..
            } => {
                if ok {
                    tracing::info!(request_id, "{message}")
                } else {
                    tracing::warn!(request_id, "{message}")
                }
            }
        }
    }
}

/// Forwards events to a channel, e.g. for a UI thread. Events are dropped
/// once the receiver is gone.
impl EventSink for UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.send(event);
    }
}

/// Sends each event to both sinks.
pub struct Tee<A, B>(pub A, pub B);

impl<A: EventSink, B: EventSink> EventSink for Tee<A, B> {
    fn emit(&self, event: PipelineEvent) {
        self.0.emit(event.clone());
        self.1.emit(event);
    }
}
