//! goproxy.cn mirror
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         goproxy.cn                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Proxy     │───▶│   Upstream   │───▶│    Upload    │       │
//! │  │   Server     │    │    Engine    │    │  Coalescer   │       │
//! │  │  (redirect)  │    │   (origin)   │    │ (background) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use goproxy_cn::adapters::{S3Config, S3ObjectStore};
use goproxy_cn::cache::{
    LocalStagingStore, MirrorCacher, StagingConfig, StorageReader, UploadCoalescer,
    UploaderConfig,
};
use goproxy_cn::engine::{UpstreamConfig, UpstreamEngine};
use goproxy_cn::error::{Error, Result};
use goproxy_cn::handler::{ProxyServer, RedirectConfig, RedirectPolicy, ServerConfig};
use goproxy_cn::metrics::ProxyMetrics;
use goproxy_cn::retry::RetryPolicy;

// =============================================================================
// CLI Arguments
// =============================================================================

/// goproxy.cn - Go module mirror with a redirecting object-storage cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Proxy bind address
    #[arg(long, env = "GOPROXY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Upstream Go module proxy
    #[arg(long, env = "GOPROXY_UPSTREAM", default_value = "https://proxy.golang.org")]
    upstream: String,

    /// Sum database hosts that may be proxied
    #[arg(
        long,
        env = "GOPROXY_SUPPORTED_SUMDB_HOSTS",
        value_delimiter = ',',
        default_value = "sum.golang.org,sum.golang.google.cn"
    )]
    supported_sumdb_hosts: Vec<String>,

    /// Proxy that sum database requests are routed through
    #[arg(long, env = "GOPROXY_SUMDB_PROXY")]
    sumdb_proxy: Option<String>,

    /// Redirect large durable artifacts to presigned URLs
    #[arg(long, env = "GOPROXY_AUTO_REDIRECT", default_value = "true", action = ArgAction::Set)]
    auto_redirect: bool,

    /// Smallest artifact in bytes that is redirected
    #[arg(long, env = "GOPROXY_MIN_REDIRECT_SIZE", default_value = "10485760")]
    min_redirect_size: u64,

    /// Lifetime of presigned redirect URLs in seconds
    #[arg(long, env = "GOPROXY_REDIRECT_EXPIRY_SECONDS", default_value = "86400")]
    redirect_expiry_seconds: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "GOPROXY_REQUEST_TIMEOUT_SECONDS", default_value = "600")]
    request_timeout_seconds: u64,

    /// Directory the local staging area is created in
    #[arg(long, env = "GOPROXY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Maximum concurrent background uploads
    #[arg(long, env = "GOPROXY_MAX_CONCURRENT_UPLOADS", default_value = "16")]
    max_concurrent_uploads: usize,

    /// Grace period for in-flight uploads at shutdown, in seconds
    #[arg(long, env = "GOPROXY_SHUTDOWN_GRACE_SECONDS", default_value = "30")]
    shutdown_grace_seconds: u64,

    /// S3 endpoint
    #[arg(long, env = "S3_ENDPOINT", default_value = "http://127.0.0.1:9000")]
    s3_endpoint: String,

    /// S3 endpoint used in redirect URLs
    #[arg(long, env = "S3_PUBLIC_ENDPOINT")]
    s3_public_endpoint: Option<String>,

    /// S3 bucket
    #[arg(long, env = "S3_BUCKET", default_value = "goproxy")]
    s3_bucket: String,

    /// S3 signing region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    s3_region: String,

    /// S3 access key id
    #[arg(long, env = "S3_ACCESS_KEY_ID", default_value = "")]
    s3_access_key: String,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", default_value = "", hide_env_values = true)]
    s3_secret_key: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Expose error details in responses and log at debug level
    #[arg(long, env = "GOPROXY_DEBUG")]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting goproxy.cn");
    info!("  Upstream: {}", args.upstream);
    info!("  S3 endpoint: {} (bucket {})", args.s3_endpoint, args.s3_bucket);
    info!("  Auto redirect: {}", args.auto_redirect);
    info!("  Min redirect size: {} bytes", args.min_redirect_size);
    info!("  Debug mode: {}", args.debug);

    let metrics = ProxyMetrics::new()?;
    let retry = RetryPolicy::default();

    let store = Arc::new(S3ObjectStore::new(S3Config {
        endpoint: args.s3_endpoint.clone(),
        public_endpoint: args.s3_public_endpoint.clone(),
        bucket: args.s3_bucket.clone(),
        region: args.s3_region.clone(),
        access_key: args.s3_access_key.clone(),
        secret_key: args.s3_secret_key.clone(),
        ..S3Config::default()
    })?);

    let staging = Arc::new(LocalStagingStore::new(StagingConfig {
        parent_dir: args.cache_dir.clone(),
        ..StagingConfig::default()
    })?);
    info!("Staging local caches in {}", staging.root().display());

    let coalescer = Arc::new(UploadCoalescer::new(
        store.clone(),
        UploaderConfig {
            max_concurrent_uploads: args.max_concurrent_uploads,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_seconds),
            retry: retry.clone(),
            ..UploaderConfig::default()
        },
        metrics.clone(),
    ));

    let reader = StorageReader::new(store.clone(), retry.clone());
    let cacher = Arc::new(MirrorCacher::new(reader.clone(), staging.clone(), coalescer.clone()));

    let engine = UpstreamEngine::new(
        UpstreamConfig {
            upstream_url: args.upstream.clone(),
            supported_sumdb_hosts: args.supported_sumdb_hosts.clone(),
            sumdb_proxy: args.sumdb_proxy.clone(),
            retry: retry.clone(),
            ..UpstreamConfig::default()
        },
        cacher,
    )?;

    let policy = RedirectPolicy::new(
        RedirectConfig {
            auto_redirect: args.auto_redirect,
            min_size: args.min_redirect_size,
            expiry: Duration::from_secs(args.redirect_expiry_seconds),
        },
        reader,
        metrics.clone(),
    )?;

    let server = Arc::new(ProxyServer::new(
        ServerConfig {
            listen_addr: args.listen_addr.clone(),
            request_timeout: Duration::from_secs(args.request_timeout_seconds),
            debug: args.debug,
        },
        policy,
        Arc::new(engine),
        metrics.clone(),
    ));

    // The upload loop ignores the signal token and runs until `coalescer.stop()`,
    // so artifacts committed while connections drain are still promoted.
    coalescer.start();

    let health_addr = args.health_addr.clone();
    let health_coalescer = coalescer.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_coalescer).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_handle = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_handle).await {
            error!("Metrics server error: {}", e);
        }
    });

    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let serve = tokio::spawn(server.serve(listener, shutdown.clone()));
    shutdown.cancelled().await;

    match tokio::time::timeout(Duration::from_secs(args.request_timeout_seconds), serve).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Proxy server error: {}", e),
        Ok(Err(e)) => error!("Proxy server task failed: {}", e),
        Err(_) => warn!("Timed out draining client connections"),
    }

    coalescer.stop().await;
    if !staging.cleanup().await {
        warn!("Local caches left behind in {}", staging.root().display());
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = if args.debug {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn", "reqwest=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address {}: {}", server, addr, e)))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, coalescer: Arc<UploadCoalescer>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    fn reply(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    let listener = TcpListener::bind(parse_addr(addr, "health")?)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let coalescer = coalescer.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let coalescer = coalescer.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => {
                            reply(StatusCode::OK, "text/plain", b"ok".to_vec())
                        }
                        "/readyz" => match serde_json::to_vec(&coalescer.stats()) {
                            Ok(body) => reply(StatusCode::OK, "application/json", body),
                            Err(e) => reply(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "text/plain",
                                e.to_string().into_bytes(),
                            ),
                        },
                        _ => reply(StatusCode::NOT_FOUND, "text/plain", b"not found".to_vec()),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: ProxyMetrics) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = TcpListener::bind(parse_addr(addr, "metrics")?)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Full::new(Bytes::new()));
                    match (req.uri().path(), metrics.encode()) {
                        ("/metrics", Ok((content_type, buffer))) => {
                            *response.body_mut() = Full::new(Bytes::from(buffer));
                            if let Ok(value) = content_type.parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                        }
                        ("/metrics", Err(e)) => {
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            *response.body_mut() = Full::new(Bytes::from(e.to_string()));
                        }
                        _ => {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Full::new(Bytes::from("not found"));
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
