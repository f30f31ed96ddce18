//! Local HTTP endpoint. See [`crate::protocol`] for routes and bodies.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, request, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{Settings, SettingsProvider};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent, Stage};
use crate::pipeline::{self, PipelineOutcome};
use crate::protocol::{self, WireResponse, MAX_REQUEST_BYTES};
use crate::source::{AllowList, PatchRequest};

/// How long a client may take to send its headers, and then its body.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Connections beyond this many are closed as soon as they are accepted.
pub const MAX_CONNECTIONS: usize = 64;
const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

/// Loopback address for `port`. Requests from other machines are never
/// accepted.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

pub struct Listener {
    listener: TcpListener,
    settings: Arc<dyn SettingsProvider>,
    events: Arc<dyn EventSink>,
    read_timeout: Duration,
    max_connections: usize,
}

struct Shared {
    settings: Arc<dyn SettingsProvider>,
    events: Arc<dyn EventSink>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    read_timeout: Duration,
}

impl Listener {
    /// Bind to `addr`. Port 0 picks a free port; see [`Listener::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        settings: Arc<dyn SettingsProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {addr}"))?;
        Ok(Self {
            listener,
            settings,
            events,
            read_timeout: READ_TIMEOUT,
            max_connections: MAX_CONNECTIONS,
        })
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.max_connections = limit.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until `shutdown` resolves. Requests already in
    /// flight keep running on their own tasks.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        let workers = self.settings.latest().max_concurrent_requests.max(1);
        let shared = Arc::new(Shared {
            settings: Arc::clone(&self.settings),
            events: Arc::clone(&self.events),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(workers)),
            read_timeout: self.read_timeout,
        });
        let app = router(shared);
        let connections = Arc::new(Semaphore::new(self.max_connections));

        self.events.emit(PipelineEvent::ListenerStarted { addr });
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => match Arc::clone(&connections).try_acquire_owned() {
                        Ok(permit) => {
                            tokio::spawn(serve_connection(
                                stream,
                                peer,
                                app.clone(),
                                self.read_timeout,
                                permit,
                            ));
                        }
                        Err(_) => tracing::warn!(%peer, "too many open connections; dropping"),
                    },
                    // Usually fd exhaustion; keep serving.
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
            }
        }

        self.events.emit(PipelineEvent::ListenerStopped);
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    read_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(false);
    let service = TowerToHyperService::new(app);
    if let Err(e) = http.serve_connection(TokioIo::new(stream), service).await {
        tracing::debug!(%peer, "connection dropped: {e}");
    }
}

fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/patch", post(submit_patch))
        .layer(cors(Arc::clone(&shared.settings)))
        .with_state(shared)
}

/// Browsers on trusted sites may call the endpoint; every other origin gets
/// no CORS headers and is blocked by the browser.
fn cors(settings: Arc<dyn SettingsProvider>) -> CorsLayer {
    let trusted = move |origin: &HeaderValue, _: &request::Parts| {
        origin
            .to_str()
            .is_ok_and(|origin| AllowList::from_settings(&settings.latest()).permits_origin(origin))
    };
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(trusted))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_private_network(true)
        .max_age(CORS_MAX_AGE)
}

async fn health() -> Json<WireResponse> {
    Json(WireResponse::ok(protocol::HEALTH_MESSAGE))
}

async fn submit_patch(State(shared): State<Arc<Shared>>, body: Body) -> Response {
    let request_id = shared.next_id();
    let result = shared.handle(request_id, body).await;
    let (status, response) = protocol::reply(&result);
    (status, Json(response)).into_response()
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn handle(
        self: &Arc<Self>,
        request_id: u64,
        body: Body,
    ) -> Result<PipelineOutcome, PipelineError> {
        let (request, settings, permit) = self
            .prepare(body)
            .await
            .map_err(|e| self.reject(request_id, e))?;

        let shared = Arc::clone(self);
        let run = tokio::spawn(async move {
            let _permit = permit;
            pipeline::run(request_id, request, settings, shared.events.as_ref()).await
        });
        match run.await {
            Ok(result) => result,
            Err(join) => {
                let reason = if join.is_panic() {
                    "pipeline panicked"
                } else {
                    "pipeline cancelled"
                };
                tracing::error!(request_id, "{reason}: {join}");
                Err(self.reject(request_id, PipelineError::Internal(reason.to_string())))
            }
        }
    }

    /// Read and validate the body, take a settings snapshot and wait for a
    /// free worker.
    async fn prepare(
        &self,
        body: Body,
    ) -> Result<(PatchRequest, Arc<Settings>, OwnedSemaphorePermit), PipelineError> {
        let bytes = tokio::time::timeout(
            self.read_timeout,
            axum::body::to_bytes(body, MAX_REQUEST_BYTES),
        )
        .await
        .map_err(|_| {
            PipelineError::InvalidRequest(format!(
                "request body not received within {:?}",
                self.read_timeout
            ))
        })?
        .map_err(|e| PipelineError::InvalidRequest(format!("cannot read request body: {e}")))?;

        let body = protocol::parse_patch_body(&bytes)?;
        let settings = self.load_settings().await?;
        let request = body.into_request(&settings)?;
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Internal("worker pool closed".to_string()))?;
        Ok((request, settings, permit))
    }

    /// Snapshots may read the settings file, so they run off the runtime.
    async fn load_settings(&self) -> Result<Arc<Settings>, PipelineError> {
        let provider = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || provider.snapshot())
            .await
            .map_err(|e| PipelineError::Internal(format!("settings task failed: {e}")))
    }

    /// Report a request that failed outside the pipeline.
    fn reject(&self, request_id: u64, err: PipelineError) -> PipelineError {
        self.events.emit(PipelineEvent::StageChanged {
            request_id,
            stage: Stage::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        });
        self.events.emit(PipelineEvent::Finished {
            request_id,
            ok: false,
            message: err.user_message().to_string(),
            output_path: None,
        });
        err
    }
}
