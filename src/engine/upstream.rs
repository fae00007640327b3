//! Upstream-forwarding origin engine
//!
//! Serves module artifacts from the cache when present, otherwise fetches
//! them from the upstream proxy, answers the client and stages the artifact
//! for promotion. Version lists, `@latest` queries and sum database requests
//! are forwarded uncached.
//!
//! Response bodies are `Full<Bytes>`, so a response holds at most one
//! artifact (or the requested span of it) in memory. Artifacts above the
//! redirect threshold never reach this engine while redirects are enabled;
//! `Range` requests on a hit fetch only the requested bytes from storage.

use std::io::{Cursor, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
    LAST_MODIFIED, RANGE,
};
use hyper::{HeaderMap, Response, StatusCode};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::{finish, OriginEngine, OriginRequest, IMMUTABLE, NO_CACHE};
use crate::cache::ObjectReader;
use crate::domain::{Artifact, ArtifactKind, Cacher, Checksum};
use crate::error::{Error, Result};
use crate::retry::{retry_n, RetryPolicy};

/// Upstream engine configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the upstream module proxy
    pub upstream_url: String,

    /// Sum database hosts that may be proxied
    pub supported_sumdb_hosts: Vec<String>,

    /// Route sum database requests through `<proxy>/sumdb/<host>/...` instead
    /// of contacting the host directly
    pub sumdb_proxy: Option<String>,

    /// Per-request timeout for upstream fetches
    pub timeout: Duration,

    /// Retry policy for upstream fetches
    pub retry: RetryPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://proxy.golang.org".to_string(),
            supported_sumdb_hosts: vec![
                "sum.golang.org".to_string(),
                "sum.golang.google.cn".to_string(),
            ],
            sumdb_proxy: None,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// What an upstream fetch returned
#[derive(Debug)]
struct Fetched {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

/// Upstream gateway failures worth another attempt.
fn is_upstream_retryable(e: &Error) -> bool {
    match e {
        Error::Backend { status, .. } => matches!(status, 502..=504),
        Error::Transport(_) | Error::Timeout { .. } => true,
        _ => false,
    }
}

/// How a cache name is routed
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Sumdb { host: &'a str, path: &'a str },
    List,
    Artifact,
    Unknown,
}

fn route(name: &str) -> Route<'_> {
    if let Some(rest) = name.strip_prefix("sumdb/") {
        return match rest.split_once('/') {
            Some((host, path)) => Route::Sumdb { host, path },
            None => Route::Unknown,
        };
    }
    if name.ends_with("/@v/list") || name.ends_with("/@latest") {
        return Route::List;
    }
    match name.split_once("/@v/") {
        Some((module, file))
            if !module.is_empty() && !file.contains('/') && ArtifactKind::from_name(file).is_some() =>
        {
            Route::Artifact
        }
        _ => Route::Unknown,
    }
}

/// How an artifact request is answered, given its conditional headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyPlan {
    NotModified,
    Full,
    /// Inclusive byte span
    Partial(u64, u64),
    Unsatisfiable,
}

impl BodyPlan {
    fn for_request(headers: &HeaderMap, etag: &str, size: u64) -> Self {
        if let Some(tags) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
            if tags.split(',').map(str::trim).any(|t| t == "*" || t == etag) {
                return BodyPlan::NotModified;
            }
        }
        match headers.get(RANGE).and_then(|v| v.to_str().ok()) {
            Some(range) => parse_range(range, size),
            None => BodyPlan::Full,
        }
    }
}

/// Parse a single `bytes=` range. Multi-range and malformed headers are
/// ignored and the whole body is served.
fn parse_range(header: &str, size: u64) -> BodyPlan {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return BodyPlan::Full;
    };
    if spec.contains(',') {
        return BodyPlan::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return BodyPlan::Full;
    };

    if first.is_empty() {
        return match last.parse::<u64>() {
            Ok(0) => BodyPlan::Unsatisfiable,
            Ok(_) if size == 0 => BodyPlan::Unsatisfiable,
            Ok(n) => BodyPlan::Partial(size - n.min(size), size - 1),
            Err(_) => BodyPlan::Full,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return BodyPlan::Full;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return BodyPlan::Full,
        }
    };
    if start >= size {
        return BodyPlan::Unsatisfiable;
    }
    BodyPlan::Partial(start, end.min(size - 1))
}

/// Read the inclusive span `[start, end]` from a durable object.
async fn read_span(reader: &mut ObjectReader, start: u64, end: u64) -> Result<Bytes> {
    reader.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start + 1) as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

/// Origin engine backed by an upstream Go module proxy
pub struct UpstreamEngine {
    config: UpstreamConfig,
    cacher: Arc<dyn Cacher>,
    client: Client,
}

impl UpstreamEngine {
    pub fn new(config: UpstreamConfig, cacher: Arc<dyn Cacher>) -> Result<Self> {
        Url::parse(&config.upstream_url).map_err(|e| {
            Error::Config(format!("invalid upstream url {:?}: {}", config.upstream_url, e))
        })?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            cacher,
            client,
        })
    }

    fn upstream_url(&self, name: &str) -> Result<Url> {
        join_url(&self.config.upstream_url, name)
    }

    fn sumdb_url(&self, host: &str, path: &str) -> Result<Url> {
        match &self.config.sumdb_proxy {
            Some(proxy) => join_url(proxy, &format!("sumdb/{}/{}", host, path)),
            None => join_url(&format!("https://{}", host), path),
        }
    }

    async fn fetch(&self, cx: &CancellationToken, url: Url) -> Result<Fetched> {
        let retry = &self.config.retry;
        retry_n(
            cx,
            "upstream",
            || {
                let url = url.clone();
                async move {
                    let response = self.client.get(url).send().await?;
                    let status = response.status();
                    if matches!(status.as_u16(), 502..=504) {
                        return Err(Error::backend("upstream", status.as_u16(), ""));
                    }
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = response.bytes().await?;
                    Ok(Fetched {
                        status: StatusCode::from_u16(status.as_u16())
                            .unwrap_or(StatusCode::BAD_GATEWAY),
                        content_type,
                        body,
                    })
                }
            },
            is_upstream_retryable,
            retry.interval,
            retry.max_attempts,
        )
        .await
    }

    #[instrument(skip(self, cx))]
    async fn serve_sumdb(
        &self,
        cx: &CancellationToken,
        host: &str,
        path: &str,
    ) -> Result<Response<Full<Bytes>>> {
        let host = host.to_ascii_lowercase();
        if !self.config.supported_sumdb_hosts.iter().any(|h| h == &host) {
            return not_found();
        }
        if path == "supported" {
            return finish(
                Response::builder()
                    .status(StatusCode::OK)
                    .header(CACHE_CONTROL, NO_CACHE)
                    .body(Full::new(Bytes::new())),
            );
        }

        let fetched = self.fetch(cx, self.sumdb_url(&host, path)?).await?;
        if fetched.status != StatusCode::OK {
            debug!(status = %fetched.status, "Sum database answered non-200");
            return not_found();
        }
        passthrough(fetched)
    }

    #[instrument(skip(self, cx))]
    async fn serve_list(&self, cx: &CancellationToken, name: &str) -> Result<Response<Full<Bytes>>> {
        let fetched = self.fetch(cx, self.upstream_url(name)?).await?;
        match fetched.status {
            StatusCode::OK => passthrough(fetched),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(Error::ModuleNotFound(name.to_string())),
            status => Err(Error::backend("upstream", status.as_u16(), body_text(&fetched.body))),
        }
    }

    /// Hits honor `If-None-Match` and single `Range` requests. Misses are
    /// buffered whole, answered and staged; a staging failure fails the
    /// request so the artifact is fetched again on the next miss.
    #[instrument(skip(self, cx, headers))]
    async fn serve_artifact(
        &self,
        cx: &CancellationToken,
        name: &str,
        headers: &HeaderMap,
    ) -> Result<Response<Full<Bytes>>> {
        match self.cacher.cache(cx, name).await {
            Ok(mut cache) => {
                let size = cache.reader.size();
                let plan = BodyPlan::for_request(headers, &cache.artifact.checksum.etag(), size);
                let body = match plan {
                    BodyPlan::Full => cache.reader.read_to_end().await?,
                    BodyPlan::Partial(start, end) => read_span(&mut cache.reader, start, end).await?,
                    BodyPlan::NotModified | BodyPlan::Unsatisfiable => Bytes::new(),
                };
                cache.reader.close()?;
                return artifact_response(&cache.artifact, plan, size, body);
            }
            Err(Error::CacheNotFound) => debug!("Cache miss, fetching from upstream"),
            Err(e) => return Err(e),
        }

        let fetched = self.fetch(cx, self.upstream_url(name)?).await?;
        match fetched.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(Error::ModuleNotFound(name.to_string()))
            }
            status => {
                return Err(Error::backend(
                    "upstream",
                    status.as_u16(),
                    body_text(&fetched.body),
                ))
            }
        }

        let artifact = Artifact::with_metadata(
            name,
            crate::domain::mime_type_for(name),
            fetched.body.len() as u64,
            Utc::now(),
            Checksum::compute(&fetched.body),
        );
        self.cacher
            .set_cache(cx, artifact.clone(), Box::new(Cursor::new(fetched.body.clone())))
            .await?;

        let size = fetched.body.len() as u64;
        let plan = BodyPlan::for_request(headers, &artifact.checksum.etag(), size);
        let body = match plan {
            BodyPlan::Full => fetched.body,
            BodyPlan::Partial(start, end) => fetched.body.slice(start as usize..=end as usize),
            BodyPlan::NotModified | BodyPlan::Unsatisfiable => Bytes::new(),
        };
        artifact_response(&artifact, plan, size, body)
    }
}

#[async_trait]
impl OriginEngine for UpstreamEngine {
    async fn serve(
        &self,
        cx: &CancellationToken,
        req: &OriginRequest,
    ) -> Result<Response<Full<Bytes>>> {
        match route(&req.name) {
            Route::Sumdb { host, path } => self.serve_sumdb(cx, host, path).await,
            Route::List => self.serve_list(cx, &req.name).await,
            Route::Artifact => self.serve_artifact(cx, &req.name, &req.headers).await,
            Route::Unknown => not_found(),
        }
    }
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| Error::Config(format!("invalid url {:?}: {}", joined, e)))
}

fn body_text(body: &Bytes) -> String {
    String::from_utf8_lossy(&body[..body.len().min(512)]).into_owned()
}

fn not_found() -> Result<Response<Full<Bytes>>> {
    finish(
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from_static(b"Not Found"))),
    )
}

fn passthrough(fetched: Fetched) -> Result<Response<Full<Bytes>>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CACHE_CONTROL, NO_CACHE)
        .header(CONTENT_LENGTH, fetched.body.len());
    if let Some(content_type) = fetched.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    finish(builder.body(Full::new(fetched.body)))
}

fn artifact_response(
    artifact: &Artifact,
    plan: BodyPlan,
    size: u64,
    body: Bytes,
) -> Result<Response<Full<Bytes>>> {
    let builder = Response::builder()
        .header(ETAG, artifact.checksum.etag())
        .header(LAST_MODIFIED, artifact.last_modified())
        .header(CACHE_CONTROL, IMMUTABLE);

    let builder = match plan {
        BodyPlan::NotModified => {
            return finish(builder.status(StatusCode::NOT_MODIFIED).body(Full::new(Bytes::new())))
        }
        BodyPlan::Unsatisfiable => {
            return finish(
                builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(CONTENT_RANGE, format!("bytes */{}", size))
                    .header(CONTENT_LENGTH, 0)
                    .body(Full::new(Bytes::new())),
            )
        }
        BodyPlan::Full => builder.status(StatusCode::OK),
        BodyPlan::Partial(start, end) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, size)),
    };

    finish(
        builder
            .header(CONTENT_TYPE, artifact.mime_type.as_str())
            .header(CONTENT_LENGTH, body.len())
            .header(ACCEPT_RANGES, "bytes")
            .body(Full::new(body)),
    )
}

// =============================================================================
// Tests
// =============================================================================
