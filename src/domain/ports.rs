//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the cache layer depends on.
//! Infrastructure adapters implement these traits to provide concrete
//! implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │           ObjectStore      │      Cacher             │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  S3ObjectStore │ InMemoryObjectStore │ MirrorCacher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::artifact::Artifact;
use crate::cache::Cache;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Metadata answered by a stat of a durable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key
    pub name: String,
    /// Content length in bytes
    pub size: u64,
    /// Stored content type, if the backend reported one
    pub content_type: Option<String>,
    /// Last modification time, if the backend reported one
    pub last_modified: Option<DateTime<Utc>>,
    /// Raw entity tag as reported by the backend
    pub etag: Option<String>,
}

/// Response header overrides baked into a presigned URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOverrides {
    /// Forces `Cache-Control` on the redirected response
    pub cache_control: Option<String>,
    /// Forces `Content-Type` on the redirected response
    pub content_type: Option<String>,
}

impl ResponseOverrides {
    /// Overrides that make the redirected response cacheable for `max_age`.
    pub fn cacheable_for(max_age: Duration) -> Self {
        Self {
            cache_control: Some(format!("public, max-age={}", max_age.as_secs())),
            content_type: None,
        }
    }

    /// Query parameters understood by S3-compatible backends.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = &self.cache_control {
            pairs.push(("response-cache-control", v.clone()));
        }
        if let Some(v) = &self.content_type {
            pairs.push(("response-content-type", v.clone()));
        }
        pairs
    }
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for durable object storage.
///
/// Implementations report HTTP-style status codes through
/// [`crate::error::Error::Backend`] so the retry layer can classify them, and
/// map a missing key to [`crate::error::Error::CacheNotFound`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stat an object.
    async fn stat(&self, name: &str) -> Result<ObjectInfo>;

    /// Read `len` bytes starting at `offset`.
    async fn get_range(&self, name: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Upload a local file as `name`.
    async fn put_file(&self, name: &str, content_type: &str, path: &Path, size: u64)
        -> Result<()>;

    /// Build a time-limited signed GET URL for `name`.
    fn presign_get(
        &self,
        name: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> Result<Url>;
}

// =============================================================================
// Cacher Port
// =============================================================================

/// Streamed artifact content handed to [`Cacher::set_cache`].
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Capability the origin engine uses to read and persist proxy artifacts.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// Look up `name`. A miss is reported as `Error::CacheNotFound`.
    async fn cache(&self, cx: &CancellationToken, name: &str) -> Result<Cache>;

    /// Persist an artifact. Returns once the content is staged locally.
    async fn set_cache(
        &self,
        cx: &CancellationToken,
        artifact: Artifact,
        content: ContentReader,
    ) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
