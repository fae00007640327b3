//! HTTP front door
//!
//! Every request is normalized, offered to the redirect policy and otherwise
//! handed to the origin engine. Each request runs under its own cancellation
//! token, cancelled on timeout or when the client goes away.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::redirect::{normalize_path, RedirectDecision, RedirectPolicy};
use crate::engine::{finish, OriginEngine, OriginRequest};
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;

/// `Cache-Control` on rejected paths, to absorb scanning traffic.
pub const INVALID_PATH_CACHE_CONTROL: &str = "public, max-age=86400";

/// Front door configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the proxy listens on
    pub listen_addr: String,

    /// Upper bound on a single request
    pub request_timeout: Duration,

    /// Expose full error text in 5xx bodies
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            request_timeout: Duration::from_secs(10 * 60),
            debug: false,
        }
    }
}

/// The mirror's HTTP service
pub struct ProxyServer {
    config: ServerConfig,
    policy: RedirectPolicy,
    engine: Arc<dyn OriginEngine>,
    metrics: ProxyMetrics,
}

impl ProxyServer {
    pub fn new(
        config: ServerConfig,
        policy: RedirectPolicy,
        engine: Arc<dyn OriginEngine>,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            config,
            policy,
            engine,
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr.as_str();
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind proxy server on {}: {}", addr, e)))
    }

    /// Answer one request. Never fails; errors become status responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let (parts, _body) = req.into_parts();
        let cx = CancellationToken::new();
        let _guard = cx.clone().drop_guard();

        let outcome = tokio::time::timeout(
            self.config.request_timeout,
            self.route(&cx, &parts.method, parts.uri.path(), parts.headers.clone()),
        )
        .await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.error_response(&parts.method, parts.uri.path(), &e),
            Err(_) => {
                cx.cancel();
                let e = Error::Timeout {
                    operation: "request".to_string(),
                    duration: self.config.request_timeout,
                };
                self.error_response(&parts.method, parts.uri.path(), &e)
            }
        };

        if parts.method == Method::HEAD {
            *response.body_mut() = Full::new(Bytes::new());
        }
        self.metrics.record_response(response.status().as_u16());
        response
    }

    async fn route(
        &self,
        cx: &CancellationToken,
        method: &Method,
        raw_path: &str,
        headers: hyper::HeaderMap,
    ) -> Result<Response<Full<Bytes>>> {
        if method != Method::GET && method != Method::HEAD {
            return finish(
                Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .header(ALLOW, "GET, HEAD")
                    .body(Full::new(Bytes::from_static(b"Method Not Allowed"))),
            );
        }

        let name = match normalize_path(raw_path) {
            Ok(name) => name,
            Err(e) => {
                debug!(error = %e, "Rejected request path");
                return finish(
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .header(CACHE_CONTROL, INVALID_PATH_CACHE_CONTROL)
                        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                        .body(Full::new(Bytes::from_static(b"Not Found"))),
                );
            }
        };

        match self.policy.decide(cx, &name).await? {
            RedirectDecision::RedirectTo { url, expires_at } => {
                debug!(name, %expires_at, "Issuing redirect");
                finish(
                    Response::builder()
                        .status(StatusCode::FOUND)
                        .header(LOCATION, url.as_str())
                        .header(CACHE_CONTROL, "no-store")
                        .header(CONTENT_LENGTH, 0)
                        .body(Full::new(Bytes::new())),
                )
            }
            RedirectDecision::ServeViaEngine => {
                let req = OriginRequest {
                    method: method.clone(),
                    name,
                    headers,
                };
                self.engine.serve(cx, &req).await
            }
        }
    }

    fn error_response(&self, method: &Method, path: &str, e: &Error) -> Response<Full<Bytes>> {
        let status = e.status_code();
        let body = if status.is_server_error() {
            error!(%method, path, error = %e, "Request failed");
            if self.config.debug {
                e.to_string()
            } else {
                status.canonical_reason().unwrap_or("Internal Server Error").to_string()
            }
        } else {
            debug!(%method, path, error = %e, "Request rejected");
            status.canonical_reason().unwrap_or("Error").to_string()
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Accept connections until `shutdown` fires, then drain open ones.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Proxy listening on {}", addr);
        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();

            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { Ok::<_, Infallible>(this.handle(req).await) }
                });
                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!(%peer, "Connection error: {}", e);
                }
            });
        }

        connections.close();
        connections.wait().await;
        info!("Proxy stopped accepting connections");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryObjectStore, StoreOp};
    use crate::cache::StorageReader;
    use crate::handler::redirect::RedirectConfig;
    use crate::retry::RetryPolicy;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;

    /// Records what reaches it and answers 200 with the name.
    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<String>>,
        fail_with: Mutex<Option<u16>>,
    }

    #[async_trait]
    impl OriginEngine for RecordingEngine {
        async fn serve(
            &self,
            _cx: &CancellationToken,
            req: &OriginRequest,
        ) -> Result<Response<Full<Bytes>>> {
            self.seen.lock().push(req.name.clone());
            if let Some(status) = *self.fail_with.lock() {
                return Err(Error::backend("upstream", status, "upstream exploded"));
            }
            Ok(Response::new(Full::new(Bytes::from(req.name.clone()))))
        }
    }

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        engine: Arc<RecordingEngine>,
        server: ProxyServer,
    }

    fn fixture(debug: bool) -> Fixture {
        let store = Arc::new(InMemoryObjectStore::new());
        let engine = Arc::new(RecordingEngine::default());
        let metrics = ProxyMetrics::new().unwrap();
        let reader = StorageReader::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 2,
                interval: Duration::from_millis(1),
            },
        );
        let policy = RedirectPolicy::new(
            RedirectConfig {
                min_size: 8,
                ..RedirectConfig::default()
            },
            reader,
            metrics.clone(),
        )
        .unwrap();
        let server = ProxyServer::new(
            ServerConfig {
                debug,
                ..ServerConfig::default()
            },
            policy,
            engine.clone(),
            metrics,
        );
        Fixture {
            store,
            engine,
            server,
        }
    }

    fn request(method: Method, path: &str) -> Request<()> {
        Request::builder().method(method).uri(path).body(()).unwrap()
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_large_hit_redirects() {
        let f = fixture(false);
        f.store.put_bytes("example.com/mod/@v/v1.2.3.zip", "application/zip", "0123456789");

        let response = f
            .server
            .handle(request(Method::GET, "/example.com/mod/@v/v1.2.3.zip"))
            .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().unwrap();
        assert!(location.contains("mod/@v/v1.2.3.zip"));
        assert!(location.contains("X-Amz-Signature="));
        assert!(f.engine.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_small_hit_served_by_engine() {
        let f = fixture(false);
        f.store.put_bytes("example.com/mod/@v/v1.2.3.mod", "text/plain", "module");

        let response = f
            .server
            .handle(request(Method::GET, "/example.com/mod/@v/v1.2.3.mod"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*f.engine.seen.lock(), vec!["example.com/mod/@v/v1.2.3.mod".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_paths_are_cacheable_404() {
        let f = fixture(false);

        for path in [
            "/example.com/../secret",
            "/example.com/%2e%2e/secret",
            "/example.com/mod/@v/",
            "/example.com/%zz/@v/v1.0.0.zip",
        ] {
            let response = f.server.handle(request(Method::GET, path)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
            assert_eq!(
                response.headers()[CACHE_CONTROL],
                INVALID_PATH_CACHE_CONTROL,
                "{}",
                path
            );
        }
        assert_eq!(f.store.stats().stats, 0);
        assert!(f.engine.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_other_methods_rejected() {
        let f = fixture(false);
        let response = f
            .server
            .handle(request(Method::POST, "/example.com/mod/@v/v1.2.3.zip"))
            .await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");
    }

    #[tokio::test]
    async fn test_head_has_empty_body() {
        let f = fixture(false);
        let response = f
            .server
            .handle(request(Method::HEAD, "/example.com/mod/@v/list"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_server_errors_hide_detail_without_debug() {
        let f = fixture(false);
        *f.engine.fail_with.lock() = Some(403);

        let response = f
            .server
            .handle(request(Method::GET, "/example.com/mod/@v/list"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response).await, Bytes::from("Internal Server Error"));
    }

    #[tokio::test]
    async fn test_server_errors_show_detail_in_debug() {
        let f = fixture(true);
        *f.engine.fail_with.lock() = Some(403);

        let response = f
            .server
            .handle(request(Method::GET, "/example.com/mod/@v/list"))
            .await;

        let body = body_of(response).await;
        assert!(String::from_utf8_lossy(&body).contains("upstream exploded"));
    }

    #[tokio::test]
    async fn test_storage_outage_is_bad_gateway() {
        let f = fixture(false);
        f.store.fail_always(StoreOp::Stat, 503);

        let response = f
            .server
            .handle(request(Method::GET, "/example.com/mod/@v/v1.2.3.zip"))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(f.engine.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bind_uses_configured_address() {
        let mut f = fixture(false);
        f.server.config.listen_addr = "127.0.0.1:0".to_string();

        let listener = f.server.bind().await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());

        f.server.config.listen_addr = "not an address".to_string();
        assert_matches!(f.server.bind().await, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        struct SlowEngine;

        #[async_trait]
        impl OriginEngine for SlowEngine {
            async fn serve(
                &self,
                cx: &CancellationToken,
                _req: &OriginRequest,
            ) -> Result<Response<Full<Bytes>>> {
                cx.cancelled().await;
                Err(Error::Cancelled)
            }
        }

        let store = Arc::new(InMemoryObjectStore::new());
        let metrics = ProxyMetrics::new().unwrap();
        let policy = RedirectPolicy::new(
            RedirectConfig::default(),
            StorageReader::new(store, RetryPolicy::default()),
            metrics.clone(),
        )
        .unwrap();
        let server = ProxyServer::new(
            ServerConfig {
                request_timeout: Duration::from_millis(50),
                ..ServerConfig::default()
            },
            policy,
            Arc::new(SlowEngine),
            metrics,
        );

        let response = server.handle(request(Method::GET, "/example.com/mod/@v/list")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
