//! Cache-read adapter
//!
//! Answers "is this artifact durable, and what is it?" and hands back a
//! seekable reader that fetches byte ranges lazily.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::domain::{Artifact, ArtifactKind, Checksum, ObjectInfo, ObjectStore};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// A cache hit: artifact metadata plus a reader over its content.
pub struct Cache {
    pub artifact: Artifact,
    pub reader: ObjectReader,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("artifact", &self.artifact)
            .field("offset", &self.reader.offset)
            .finish_non_exhaustive()
    }
}

/// Durable-storage lookups through the retry wrapper
#[derive(Clone)]
pub struct StorageReader {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StorageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReader")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StorageReader {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Look up `name`. A backend miss surfaces as [`Error::CacheNotFound`].
    #[instrument(skip(self, cx))]
    pub async fn cache(&self, cx: &CancellationToken, name: &str) -> Result<Cache> {
        let info = self
            .retry
            .run(cx, "stat", || self.store.stat(name))
            .await?;
        let artifact = artifact_from_info(name, info);

        Ok(Cache {
            reader: ObjectReader {
                store: self.store.clone(),
                retry: self.retry.clone(),
                cx: cx.clone(),
                name: name.to_string(),
                size: artifact.size,
                offset: 0,
                closed: false,
            },
            artifact,
        })
    }
}

fn artifact_from_info(name: &str, info: ObjectInfo) -> Artifact {
    let mime_type = ArtifactKind::from_name(name)
        .map(|k| k.mime_type().to_string())
        .or(info.content_type.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let checksum = info
        .etag
        .as_deref()
        .map(Checksum::from_etag)
        .unwrap_or_default();

    Artifact::with_metadata(
        name,
        mime_type,
        info.size,
        info.last_modified.unwrap_or_else(Utc::now),
        checksum,
    )
}

// =============================================================================
// Object Reader
// =============================================================================

/// Seekable reader over a durable object. Each `read` is one ranged GET.
pub struct ObjectReader {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    cx: CancellationToken,
    name: String,
    size: u64,
    offset: u64,
    closed: bool,
}

impl ObjectReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    async fn fetch(&self, len: u64) -> Result<Bytes> {
        let (name, offset) = (self.name.as_str(), self.offset);
        self.retry
            .run(&self.cx, "get", || self.store.get_range(name, offset, len))
            .await
    }

    /// Read up to `buf.len()` bytes at the current offset. Returns 0 at end.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if self.offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(self.size - self.offset);
        let data = self.fetch(want).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.offset += n as u64;
        Ok(n)
    }

    /// Read everything from the current offset to the end.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        self.ensure_open()?;
        if self.offset >= self.size {
            return Ok(Bytes::new());
        }

        let data = self.fetch(self.size - self.offset).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    /// Reposition relative to the start, the current offset or the end.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target: i128 = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.offset as i128 + d as i128,
            SeekFrom::End(d) => self.size as i128 + d as i128,
        };
        if target < 0 {
            return Err(Error::InvalidSeek { offset: target });
        }

        self.offset = u64::try_from(target).map_err(|_| Error::InvalidSeek { offset: target })?;
        Ok(self.offset)
    }

    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
