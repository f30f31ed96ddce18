mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    overwrite_patch, post_patch, trust_loopback, PatchBuilder, Reply, StubServer, Workspace,
};
use rom_patcher::config::{FixedSettings, Settings};
use rom_patcher::events::{EventSink, PipelineEvent, Stage, TracingSink};
use rom_patcher::launcher::LaunchStatus;
use rom_patcher::listener::{self, Listener};
use rom_patcher::pipeline;
use rom_patcher::protocol::{self, PatchBody};
use rom_patcher::source::{AllowList, Downloader, PatchRequest, PatchSource};
use serde_json::json;
use tokio::sync::mpsc;

const ROM_SIZE: usize = 4 * 1024 * 1024;

fn inline(patch: Vec<u8>, name: &str) -> PatchRequest {
    PatchRequest {
        source: PatchSource::Inline(patch),
        name: Some(name.to_string()),
    }
}

#[tokio::test]
async fn test_end_to_end_literal_patch() {
    let ws = Workspace::new(vec![0u8; ROM_SIZE]);
    let literal: Vec<u8> = (1..=16).collect();
    let patch = PatchBuilder::new(ROM_SIZE, literal.len())
        .target_read(&literal)
        .finish(&ws.base, &literal);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = pipeline::run(1, inline(patch, "Kaizo Cave"), Arc::new(ws.settings()), &tx)
        .await
        .unwrap();

    assert_eq!(outcome.launch.as_ref().unwrap(), &LaunchStatus::NoEmulatorConfigured);
    assert_eq!(outcome.output.path, ws.out_dir().join("Kaizo Cave.sfc"));
    assert_eq!(std::fs::read(&outcome.output.path).unwrap(), literal);

    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::Finished { ok, .. } = event {
            finished = ok;
        }
    }
    assert!(finished);
}

#[tokio::test]
async fn test_overwrite_inside_full_size_rom() {
    let ws = Workspace::new(vec![0u8; ROM_SIZE]);
    let header = b"SUPER KAIZO 3   ";
    let (patch, target) = overwrite_patch(&ws.base, 0x7fc0, header);

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = pipeline::run(12, inline(patch, "Header"), Arc::new(ws.settings()), &tx)
        .await
        .unwrap();
    let written = std::fs::read(&outcome.output.path).unwrap();
    assert_eq!(written.len(), ROM_SIZE);
    assert_eq!(&written[0x7fc0..0x7fd0], header);
    assert_eq!(written, target);
}

#[tokio::test]
async fn test_identity_patch_reproduces_base() {
    let base: Vec<u8> = (0..65536u32).map(|i| (i * 7 % 251) as u8).collect();
    let ws = Workspace::new(base.clone());
    let patch = PatchBuilder::new(base.len(), base.len())
        .source_read(base.len())
        .finish(&base, &base);

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = pipeline::run(2, inline(patch, "same"), Arc::new(ws.settings()), &tx)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&outcome.output.path).unwrap(), base);
}

#[tokio::test]
async fn test_corrupted_patch_never_writes() {
    let ws = Workspace::new(vec![0u8; 4096]);
    let (patch, _) = overwrite_patch(&ws.base, 100, b"hello");

    // One flipped bit in each trailer checksum.
    for offset in 1..=12 {
        let mut bad = patch.clone();
        let at = bad.len() - offset;
        bad[at] ^= 0x01;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipeline::run(3, inline(bad, "bad"), Arc::new(ws.settings()), &tx)
            .await
            .unwrap_err();
        assert!(
            matches!(err.kind(), "patch_corrupt" | "checksum_mismatch"),
            "offset {offset}: {err}"
        );
    }

    let truncated = patch[..patch.len() - 20].to_vec();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = pipeline::run(4, inline(truncated, "short"), Arc::new(ws.settings()), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "patch_corrupt");
    assert!(!ws.out_dir().exists());
}

#[tokio::test]
async fn test_wrong_base_rom_is_checksum_mismatch() {
    let ws = Workspace::new(vec![0xffu8; 4096]);
    let other_base = vec![0u8; 4096];
    let (patch, _) = overwrite_patch(&other_base, 0, b"x");

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = pipeline::run(5, inline(patch, "x"), Arc::new(ws.settings()), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "checksum_mismatch");
    assert!(!ws.out_dir().exists());
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let ws = Workspace::new(vec![0u8; 256 * 1024]);
    let (patch_a, target_a) = overwrite_patch(&ws.base, 10, b"AAAA");
    let (patch_b, target_b) = overwrite_patch(&ws.base, 5000, b"BBBBBBBB");
    let settings = Arc::new(ws.settings());

    let (tx, _rx) = mpsc::unbounded_channel();
    let (a, b) = tokio::join!(
        pipeline::run(6, inline(patch_a, "a"), Arc::clone(&settings), &tx),
        pipeline::run(7, inline(patch_b, "b"), Arc::clone(&settings), &tx),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.output.path, b.output.path);
    assert_eq!(std::fs::read(&a.output.path).unwrap(), target_a);
    assert_eq!(std::fs::read(&b.output.path).unwrap(), target_b);
}

#[tokio::test]
async fn test_concurrent_unnamed_requests_get_distinct_files() {
    let ws = Workspace::new(vec![0u8; 64 * 1024]);
    let settings = Arc::new(ws.settings());
    let (tx, _rx) = mpsc::unbounded_channel();
    let unnamed = |patch: Vec<u8>| PatchRequest {
        source: PatchSource::Inline(patch),
        name: None,
    };

    let mut paths = Vec::new();
    for round in 0..5u64 {
        let (patch_a, target_a) = overwrite_patch(&ws.base, 100, b"first");
        let (patch_b, target_b) = overwrite_patch(&ws.base, 200, b"second");
        let (a, b) = tokio::join!(
            pipeline::run(100 + 2 * round, unnamed(patch_a), Arc::clone(&settings), &tx),
            pipeline::run(101 + 2 * round, unnamed(patch_b), Arc::clone(&settings), &tx),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.output.path, b.output.path);
        assert_eq!(std::fs::read(&a.output.path).unwrap(), target_a);
        assert_eq!(std::fs::read(&b.output.path).unwrap(), target_b);
        paths.push(a.output.path);
        paths.push(b.output.path);
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 10);
    assert_eq!(std::fs::read_dir(ws.out_dir()).unwrap().count(), 10);
}

#[tokio::test]
async fn test_untrusted_url_makes_no_request() {
    let server = StubServer::start(vec![Reply::ok(Vec::new())]).await;
    let ws = Workspace::new(vec![0u8; 1024]);
    // Default settings trust only https on the public host.
    let request = PatchRequest {
        source: PatchSource::RemoteUrl(server.url("/evil.bps")),
        name: None,
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = pipeline::run(8, request, Arc::new(ws.settings()), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "untrusted_source");
    assert_eq!(server.hits(), 0);

    let mut applied = false;
    while let Ok(event) = rx.try_recv() {
        applied |= matches!(
            event,
            PipelineEvent::StageChanged {
                stage: Stage::Applying,
                ..
            }
        );
    }
    assert!(!applied);
}

#[tokio::test]
async fn test_download_retries_transient_failure() {
    let ws = Workspace::new(vec![0u8; 2048]);
    let (patch, target) = overwrite_patch(&ws.base, 1000, b"net");
    let server = StubServer::start(vec![Reply::status(503), Reply::ok(patch)]).await;

    let request = PatchRequest {
        source: PatchSource::RemoteUrl(server.url("/patches/net.bps")),
        name: Some("net".to_string()),
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = pipeline::run(9, request, Arc::new(trust_loopback(ws.settings())), &tx)
        .await
        .unwrap();
    assert_eq!(server.hits(), 2);
    assert_eq!(std::fs::read(&outcome.output.path).unwrap(), target);
}

#[tokio::test]
async fn test_download_http_error_and_too_large() {
    let ws = Workspace::new(vec![0u8; 2048]);
    let server = StubServer::start(vec![Reply::status(404)]).await;
    let request = PatchRequest {
        source: PatchSource::RemoteUrl(server.url("/gone.bps")),
        name: None,
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = pipeline::run(10, request, Arc::new(trust_loopback(ws.settings())), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "download_failed");
    assert_eq!(server.hits(), 1);

    let big = StubServer::start(vec![Reply::ok(vec![0u8; 4096])]).await;
    let mut settings = trust_loopback(ws.settings());
    settings.max_patch_bytes = 1024;
    let request = PatchRequest {
        source: PatchSource::RemoteUrl(big.url("/big.bps")),
        name: None,
    };
    let err = pipeline::run(11, request, Arc::new(settings), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "patch_too_large");
}

#[tokio::test]
async fn test_redirect_off_allow_list_is_untrusted() {
    let ws = Workspace::new(vec![0u8; 2048]);
    let (patch, target) = overwrite_patch(&ws.base, 10, b"hop");
    let real = StubServer::start(vec![Reply::ok(patch)]).await;
    let settings = Arc::new(trust_loopback(ws.settings()));
    let (tx, _rx) = mpsc::unbounded_channel();

    // Only 127.0.0.1 is trusted, so the same server under another name is not.
    let offsite = StubServer::start(vec![Reply::redirect(&format!(
        "http://localhost:{}/real.bps",
        real.addr.port()
    ))])
    .await;
    let request = PatchRequest {
        source: PatchSource::RemoteUrl(offsite.url("/hop.bps")),
        name: None,
    };
    let err = pipeline::run(20, request, Arc::clone(&settings), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "untrusted_source");
    assert_eq!(offsite.hits(), 1);
    assert_eq!(real.hits(), 0);

    let onsite = StubServer::start(vec![Reply::redirect(&real.url("/real.bps"))]).await;
    let request = PatchRequest {
        source: PatchSource::RemoteUrl(onsite.url("/hop.bps")),
        name: Some("hop".to_string()),
    };
    let outcome = pipeline::run(21, request, settings, &tx).await.unwrap();
    assert_eq!(real.hits(), 1);
    assert_eq!(std::fs::read(&outcome.output.path).unwrap(), target);
}

#[tokio::test]
async fn test_downloader_retry_budget() {
    let allow = || AllowList::new(["127.0.0.1"], ["http"]);
    let flaky = StubServer::start(vec![Reply::status(503)]).await;
    let downloader = Downloader::new(allow(), Duration::from_secs(5), 1024)
        .unwrap()
        .with_backoff(Duration::from_millis(10));
    let url = reqwest::Url::parse(&flaky.url("/p.bps")).unwrap();
    let err = downloader.fetch(&url).await.unwrap_err();
    assert_eq!(err.kind(), "download_failed");
    assert!(err.is_retryable());
    assert!(err.to_string().contains("gave up after 3 attempts"), "{err}");
    assert_eq!(flaky.hits(), 3);

    let missing = StubServer::start(vec![Reply::status(404)]).await;
    let url = reqwest::Url::parse(&missing.url("/p.bps")).unwrap();
    let err = downloader.fetch(&url).await.unwrap_err();
    assert_eq!(err.kind(), "download_failed");
    assert!(!err.is_retryable());
    assert_eq!(missing.hits(), 1);
}

async fn serve_with(settings: Settings, events: Arc<dyn EventSink>) -> std::net::SocketAddr {
    let listener = Listener::bind(
        listener::loopback(0),
        Arc::new(FixedSettings::new(settings)),
        events,
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.serve(std::future::pending::<()>()));
    addr
}

async fn serve(settings: Settings) -> std::net::SocketAddr {
    serve_with(settings, Arc::new(TracingSink)).await
}

#[tokio::test]
async fn test_listener_inline_request() {
    let ws = Workspace::new(vec![0u8; 8192]);
    let (patch, target) = overwrite_patch(&ws.base, 16, b"wire");
    let addr = serve(ws.settings()).await;

    let response = protocol::send(addr, &PatchBody::inline(&patch).with_name("From The Wire"))
        .await
        .unwrap();

    assert!(response.is_ok(), "{response:?}");
    let path = response.output_path.unwrap();
    assert_eq!(path, ws.out_dir().join("From The Wire.sfc"));
    assert_eq!(std::fs::read(path).unwrap(), target);
}

#[tokio::test]
async fn test_listener_accepts_browser_field_names() {
    let ws = Workspace::new(vec![0u8; 4096]);
    let (patch, target) = overwrite_patch(&ws.base, 64, b"site");
    let server = StubServer::start(vec![Reply::ok(patch)]).await;
    let addr = serve(trust_loopback(ws.settings())).await;

    let (status, response) = post_patch(
        addr,
        json!({
            "patch_url": server.url("/levels/42.bps"),
            "level_name": "Level 42",
            "level_id": 42,
        }),
    )
    .await;
    assert_eq!(status, 200, "{response:?}");
    let path = response.output_path.unwrap();
    assert_eq!(path, ws.out_dir().join("Level 42.sfc"));
    assert_eq!(std::fs::read(path).unwrap(), target);
}

#[tokio::test]
async fn test_listener_reports_failures_and_keeps_serving() {
    let ws = Workspace::new(vec![0u8; 1024]);
    let addr = serve(ws.settings()).await;

    let (status, response) = post_patch(
        addr,
        json!({ "hex": hex::encode(b"BPS1 definitely not a patch") }),
    )
    .await;
    assert_eq!(status, 422);
    assert_eq!(response.error_kind.as_deref(), Some("patch_corrupt"));
    assert!(response.output_path.is_none());

    let (status, response) =
        post_patch(addr, json!({ "patch_url": "https://evil.example/p.bps" })).await;
    assert_eq!(status, 403);
    assert_eq!(response.error_kind.as_deref(), Some("untrusted_source"));

    let (status, response) = post_patch(addr, json!({ "level_name": "nothing" })).await;
    assert_eq!(status, 400);
    assert_eq!(response.error_kind.as_deref(), Some("invalid_request"));

    assert!(protocol::health(addr).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_listener_launch_failure_still_reports_output() {
    let ws = Workspace::new(vec![0u8; 1024]);
    let (patch, _) = overwrite_patch(&ws.base, 0, b"go");
    let mut settings = ws.settings();
    settings.emulator = Some(ws.path().join("no-such-emulator"));
    let addr = serve(settings).await;

    let (status, response) = post_patch(
        addr,
        json!({ "hex": hex::encode(&patch), "name": "launch" }),
    )
    .await;
    assert_eq!(status, 500);
    assert!(!response.is_ok());
    assert_eq!(response.error_kind.as_deref(), Some("launch_failed"));
    let path = response.output_path.unwrap();
    assert!(path.exists());
}

/// Panics when a request starts resolving.
struct PanickingSink;

impl EventSink for PanickingSink {
    fn emit(&self, event: PipelineEvent) {
        if matches!(
            event,
            PipelineEvent::StageChanged {
                stage: Stage::Resolving,
                ..
            }
        ) {
            panic!("sink failed while resolving");
        }
    }
}

#[tokio::test]
async fn test_listener_survives_pipeline_panic() {
    let ws = Workspace::new(vec![0u8; 1024]);
    let (patch, _) = overwrite_patch(&ws.base, 0, b"boom");
    let addr = serve_with(ws.settings(), Arc::new(PanickingSink)).await;

    let (status, response) = post_patch(addr, json!({ "hex": hex::encode(&patch) })).await;
    assert_eq!(status, 500);
    assert_eq!(response.error_kind.as_deref(), Some("internal"));
    assert!(response.output_path.is_none());

    assert!(protocol::health(addr).await.unwrap().is_ok());
    let (status, _) = post_patch(addr, json!({ "hex": "zz" })).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_stalled_download_does_not_block_listener() {
    let ws = Workspace::new(vec![0u8; 4096]);
    let (slow_patch, slow_target) = overwrite_patch(&ws.base, 1, b"slow");
    let (fast_patch, fast_target) = overwrite_patch(&ws.base, 2, b"fast");
    let server =
        StubServer::start(vec![Reply::ok(slow_patch).delayed(Duration::from_millis(1500))]).await;
    let addr = serve(trust_loopback(ws.settings())).await;

    let slow_url = server.url("/slow.bps");
    let slow = tokio::spawn(async move {
        post_patch(addr, json!({ "patch_url": slow_url, "level_name": "slow" })).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let (status, response) = post_patch(
        addr,
        json!({ "hex": hex::encode(&fast_patch), "name": "fast" }),
    )
    .await;
    assert_eq!(status, 200, "{response:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        std::fs::read(response.output_path.unwrap()).unwrap(),
        fast_target
    );
    assert!(!slow.is_finished());

    let (status, response) = slow.await.unwrap();
    assert_eq!(status, 200, "{response:?}");
    assert_eq!(
        std::fs::read(response.output_path.unwrap()).unwrap(),
        slow_target
    );
}
