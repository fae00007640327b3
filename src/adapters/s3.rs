//! S3-compatible object store adapter
//!
//! Path-style addressing (`<endpoint>/<bucket>/<key>`) over reqwest. Every
//! request, including the adapter's own, is authenticated with a SigV4
//! presigned query so the same code path produces client redirect URLs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::sigv4::SigV4Signer;
use crate::domain::{ObjectInfo, ObjectStore, ResponseOverrides};
use crate::error::{Error, Result};

/// Lifetime of the presigned URLs the adapter uses for its own calls.
const INTERNAL_PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Longest backend error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for an S3-compatible bucket
#[derive(Clone)]
pub struct S3Config {
    /// Endpoint the adapter talks to, e.g. `http://minio:9000`
    pub endpoint: String,

    /// Endpoint used in client redirect URLs; defaults to `endpoint`
    pub public_endpoint: Option<String>,

    /// Bucket holding the cache
    pub bucket: String,

    /// Signing region
    pub region: String,

    /// Access key id
    pub access_key: String,

    /// Secret access key
    pub secret_key: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            public_endpoint: None,
            bucket: "goproxy".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Build the path-style URL of `name` in `bucket`.
pub(crate) fn object_url(endpoint: &str, bucket: &str, name: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid endpoint {:?}: {}", endpoint, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::Config(format!("endpoint cannot carry a path: {}", endpoint)))?;
        segments.pop_if_empty().push(bucket);
        segments.extend(name.split('/'));
    }
    Ok(url)
}

// =============================================================================
// Adapter
// =============================================================================

/// [`ObjectStore`] backed by an S3-compatible service
pub struct S3ObjectStore {
    config: S3Config,
    signer: SigV4Signer,
    client: Client,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("config", &self.config)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Config("bucket must not be empty".into()));
        }
        object_url(&config.endpoint, &config.bucket, "")?;
        if let Some(public) = &config.public_endpoint {
            object_url(public, &config.bucket, "")?;
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let signer = SigV4Signer::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.region.clone(),
        );

        Ok(Self {
            config,
            signer,
            client,
        })
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    fn signed(&self, method: &str, name: &str) -> Result<Url> {
        let url = object_url(&self.config.endpoint, &self.config.bucket, name)?;
        self.signer
            .presign(method, &url, INTERNAL_PRESIGN_EXPIRY, &[], Utc::now())
    }
}

async fn backend_error(operation: &'static str, response: Response) -> Error {
    let status = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    Error::backend(operation, status, message)
}

fn header_str<'a>(response: &'a Response, name: reqwest::header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.config.bucket))]
    async fn stat(&self, name: &str) -> Result<ObjectInfo> {
        let url = self.signed("HEAD", name)?;
        let response = self.client.head(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(Error::CacheNotFound),
            s if !s.is_success() => return Err(backend_error("stat", response).await),
            _ => {}
        }

        let size = header_str(&response, CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::backend("stat", 200, "missing Content-Length"))?;
        let last_modified = header_str(&response, LAST_MODIFIED)
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));

        let info = ObjectInfo {
            name: name.to_string(),
            size,
            content_type: header_str(&response, CONTENT_TYPE).map(str::to_string),
            last_modified,
            etag: header_str(&response, ETAG).map(str::to_string),
        };
        debug!(size = info.size, "Stat succeeded");
        Ok(info)
    }

    #[instrument(skip(self), fields(bucket = %self.config.bucket))]
    async fn get_range(&self, name: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let url = self.signed("GET", name)?;
        let range = format!("bytes={}-{}", offset, offset.saturating_add(len - 1));
        let response = self.client.get(url).header(RANGE, range).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::CacheNotFound),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            s if s.is_success() => Ok(response.bytes().await?),
            _ => Err(backend_error("get", response).await),
        }
    }

    #[instrument(skip(self, path), fields(bucket = %self.config.bucket))]
    async fn put_file(
        &self,
        name: &str,
        content_type: &str,
        path: &Path,
        size: u64,
    ) -> Result<()> {
        let url = self.signed("PUT", name)?;
        let file = tokio::fs::File::open(path).await?;
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error("put", response).await);
        }
        debug!(size, "Upload succeeded");
        Ok(())
    }

    fn presign_get(
        &self,
        name: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> Result<Url> {
        let endpoint = self
            .config
            .public_endpoint
            .as_deref()
            .unwrap_or(&self.config.endpoint);
        let url = object_url(endpoint, &self.config.bucket, name)?;
        self.signer
            .presign("GET", &url, expires_in, &overrides.query_pairs(), Utc::now())
    }
}

// =============================================================================
// Tests
// =============================================================================
