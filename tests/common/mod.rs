//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use goproxy_cn::cache::{
    LocalStagingStore, MirrorCacher, StagingConfig, StorageReader, UploadCoalescer,
    UploaderConfig,
};
use goproxy_cn::domain::ObjectStore;
use goproxy_cn::engine::{UpstreamConfig, UpstreamEngine};
use goproxy_cn::handler::{ProxyServer, RedirectConfig, RedirectPolicy, ServerConfig};
use goproxy_cn::metrics::ProxyMetrics;
use goproxy_cn::retry::RetryPolicy;

/// Canned HTTP peer: the first route whose path suffix matches answers.
/// Every request line is recorded.
pub struct Stub {
    pub url: String,
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Stub {
    pub fn requests(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

pub async fn stub(routes: Vec<(&'static str, String)>) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_bg = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let head = read_head(&mut stream).await;
            let line = head.lines().next().unwrap_or_default().to_string();
            seen_bg.lock().push(line.clone());
            let path = line.split_whitespace().nth(1).unwrap_or_default();
            let path = path.split('?').next().unwrap_or_default();

            let response = routes
                .iter()
                .find(|(suffix, _)| path.ends_with(suffix))
                .map(|(_, response)| response.clone())
                .unwrap_or_else(|| {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                });
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    Stub { url, seen }
}

/// An `HTTP/1.1 200` with a body.
pub fn ok(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(1),
    }
}

pub fn staging(dir: &Path) -> Arc<LocalStagingStore> {
    Arc::new(
        LocalStagingStore::new(StagingConfig {
            parent_dir: Some(dir.to_path_buf()),
            cleanup_interval: Duration::from_millis(10),
            cleanup_attempts: 5,
        })
        .unwrap(),
    )
}

/// The full component graph over a given store.
pub struct Mirror {
    pub metrics: ProxyMetrics,
    pub staging: Arc<LocalStagingStore>,
    pub coalescer: Arc<UploadCoalescer>,
    pub cacher: Arc<MirrorCacher>,
    pub server: Arc<ProxyServer>,
}

pub fn mirror(
    store: Arc<dyn ObjectStore>,
    dir: &Path,
    upstream_url: &str,
    redirect: RedirectConfig,
) -> Mirror {
    let metrics = ProxyMetrics::new().unwrap();
    let staging = staging(dir);
    let coalescer = Arc::new(UploadCoalescer::new(
        store.clone(),
        UploaderConfig {
            tick_interval: Duration::from_millis(10),
            retry: fast_retry(),
            ..UploaderConfig::default()
        },
        metrics.clone(),
    ));
    let reader = StorageReader::new(store, fast_retry());
    let cacher = Arc::new(MirrorCacher::new(
        reader.clone(),
        staging.clone(),
        coalescer.clone(),
    ));
    let engine = UpstreamEngine::new(
        UpstreamConfig {
            upstream_url: upstream_url.to_string(),
            retry: fast_retry(),
            ..UpstreamConfig::default()
        },
        cacher.clone(),
    )
    .unwrap();
    let policy = RedirectPolicy::new(redirect, reader, metrics.clone()).unwrap();
    let server = Arc::new(ProxyServer::new(
        ServerConfig::default(),
        policy,
        Arc::new(engine),
        metrics.clone(),
    ));

    Mirror {
        metrics,
        staging,
        coalescer,
        cacher,
        server,
    }
}

/// Serve `server` on an ephemeral port until the token is cancelled.
pub async fn listen(server: Arc<ProxyServer>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(listener, shutdown.clone()));
    (addr, shutdown)
}

/// A client that reports redirects instead of following them.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Poll until `check` holds or the deadline passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
