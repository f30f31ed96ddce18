#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rom_patcher::config::Settings;
use rom_patcher::protocol::WireResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal BPS encoder for building test patches.
pub struct PatchBuilder {
    body: Vec<u8>,
}

fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let low = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(0x80 | low);
            return;
        }
        out.push(low);
        value -= 1;
    }
}

impl PatchBuilder {
    pub fn new(source_size: usize, target_size: usize) -> Self {
        let mut body = b"BPS1".to_vec();
        push_varint(&mut body, source_size as u64);
        push_varint(&mut body, target_size as u64);
        push_varint(&mut body, 0);
        Self { body }
    }

    fn action(mut self, kind: u64, len: usize) -> Self {
        push_varint(&mut self.body, ((len as u64 - 1) << 2) | kind);
        self
    }

    pub fn source_read(self, len: usize) -> Self {
        self.action(0, len)
    }

    pub fn target_read(self, bytes: &[u8]) -> Self {
        let mut this = self.action(1, bytes.len());
        this.body.extend_from_slice(bytes);
        this
    }

    pub fn source_copy(self, len: usize, relative: i64) -> Self {
        let mut this = self.action(2, len);
        push_varint(
            &mut this.body,
            (relative.unsigned_abs() << 1) | u64::from(relative < 0),
        );
        this
    }

    pub fn finish(mut self, source: &[u8], target: &[u8]) -> Vec<u8> {
        self.body
            .extend_from_slice(&crc32fast::hash(source).to_le_bytes());
        self.body
            .extend_from_slice(&crc32fast::hash(target).to_le_bytes());
        let patch_crc = crc32fast::hash(&self.body);
        self.body.extend_from_slice(&patch_crc.to_le_bytes());
        self.body
    }
}

/// Patch that overwrites `at..at + bytes.len()` of `source` and keeps the rest.
pub fn overwrite_patch(source: &[u8], at: usize, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut target = source.to_vec();
    target[at..at + bytes.len()].copy_from_slice(bytes);
    let tail = source.len() - at - bytes.len();
    let mut builder = PatchBuilder::new(source.len(), target.len());
    if at > 0 {
        builder = builder.source_read(at);
    }
    builder = builder.target_read(bytes);
    if tail > 0 {
        // Source cursor is still at 0; jump to the tail.
        builder = builder.source_copy(tail, (at + bytes.len()) as i64);
    }
    let patch = builder.finish(source, &target);
    (patch, target)
}

/// Temporary workspace with a base ROM and output folder configured.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub base: Vec<u8>,
}

impl Workspace {
    pub fn new(base: Vec<u8>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.sfc"), &base).unwrap();
        Self { dir, base }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            base_rom: Some(self.dir.path().join("base.sfc")),
            output_dir: Some(self.out_dir()),
            ..Settings::default()
        }
    }
}

/// Plain HTTP server on loopback answering each connection with the next
/// canned response. The last response repeats.
pub struct StubServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    pub location: Option<String>,
    /// Pause before answering.
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            location: None,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::ok(Vec::new()).with_status(status)
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            location: Some(location.to_string()),
            ..Self::status(302)
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl StubServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let replies = Arc::new(replies);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let replies = Arc::clone(&replies);
                tokio::spawn(async move {
                    let reply = &replies[n.min(replies.len() - 1)];

                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(read) => request.extend_from_slice(&buf[..read]),
                        }
                    }
                    tokio::time::sleep(reply.delay).await;

                    let location = reply
                        .location
                        .as_ref()
                        .map(|l| format!("Location: {l}\r\n"))
                        .unwrap_or_default();
                    let head = format!(
                        "HTTP/1.1 {} Stub\r\n{location}Content-Length: {}\r\nConnection: close\r\n\r\n",
                        reply.status,
                        reply.body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(&reply.body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// POST a JSON body to a listener's `/patch` route.
pub async fn post_patch(addr: SocketAddr, body: serde_json::Value) -> (u16, WireResponse) {
    let response = reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .post(format!("http://{addr}/patch"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

/// Settings that trust plain HTTP on loopback.
pub fn trust_loopback(mut settings: Settings) -> Settings {
    settings.trusted_hosts = vec!["127.0.0.1".to_string()];
    settings.trusted_schemes = vec!["http".to_string()];
    settings
}
