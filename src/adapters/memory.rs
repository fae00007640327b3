//! In-memory object store for tests and local development
//!
//! Objects live in a `DashMap`. Failures can be scripted per operation so the
//! retry and promotion paths can be exercised without a real backend.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use url::Url;

use super::s3::object_url;
use super::sigv4::SigV4Signer;
use crate::domain::{Checksum, ObjectInfo, ObjectStore, ResponseOverrides};
use crate::error::{Error, Result};

/// Operation selector for scripted failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Stat,
    Get,
    Put,
}

impl StoreOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::Get => "get",
            Self::Put => "put",
        }
    }
}

#[derive(Debug)]
struct ScriptedFailure {
    op: StoreOp,
    status: u16,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// Call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub stats: u64,
    pub gets: u64,
    pub puts: u64,
    pub presigns: u64,
    pub object_count: u64,
}

/// In-memory [`ObjectStore`]
pub struct InMemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    failures: Mutex<Vec<ScriptedFailure>>,
    put_delay: Mutex<Option<Duration>>,
    signer: SigV4Signer,
    endpoint: String,
    bucket: String,
    stats: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    presigns: AtomicU64,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            failures: Mutex::new(Vec::new()),
            put_delay: Mutex::new(None),
            signer: SigV4Signer::new("minioadmin", "minioadmin", "us-east-1"),
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "goproxy".to_string(),
            stats: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            presigns: AtomicU64::new(0),
        }
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` directly, bypassing the upload path.
    pub fn put_bytes(&self, name: &str, content_type: &str, data: impl Into<Bytes>) {
        self.objects.insert(
            name.to_string(),
            StoredObject {
                data: data.into(),
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn get_bytes(&self, name: &str) -> Option<Bytes> {
        self.objects.get(name).map(|o| o.data.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Fail the next `times` calls of `op` with `status`.
    pub fn fail_next(&self, op: StoreOp, status: u16, times: u32) {
        self.failures.lock().push(ScriptedFailure {
            op,
            status,
            remaining: times,
        });
    }

    /// Fail every call of `op` with `status` until [`Self::clear_failures`].
    pub fn fail_always(&self, op: StoreOp, status: u16) {
        self.fail_next(op, status, u32::MAX);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Delay every upload, to hold promotions in flight.
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.lock() = delay;
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            stats: self.stats.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            presigns: self.presigns.load(Ordering::Relaxed),
            object_count: self.objects.len() as u64,
        }
    }

    fn scripted(&self, op: StoreOp) -> Result<()> {
        let mut failures = self.failures.lock();
        let Some(idx) = failures.iter().position(|f| f.op == op && f.remaining > 0) else {
            return Ok(());
        };
        let failure = &mut failures[idx];
        if failure.remaining != u32::MAX {
            failure.remaining -= 1;
        }
        let status = failure.status;
        if failure.remaining == 0 {
            failures.remove(idx);
        }
        drop(failures);

        if status == 404 {
            Err(Error::CacheNotFound)
        } else {
            Err(Error::backend(op.name(), status, "scripted failure"))
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn stat(&self, name: &str) -> Result<ObjectInfo> {
        self.stats.fetch_add(1, Ordering::Relaxed);
        self.scripted(StoreOp::Stat)?;

        let object = self.objects.get(name).ok_or(Error::CacheNotFound)?;
        Ok(ObjectInfo {
            name: name.to_string(),
            size: object.data.len() as u64,
            content_type: Some(object.content_type.clone()),
            last_modified: Some(object.last_modified),
            etag: Some(format!("\"{}\"", Checksum::compute(&object.data).to_hex())),
        })
    }

    async fn get_range(&self, name: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.scripted(StoreOp::Get)?;

        let data = self
            .objects
            .get(name)
            .map(|o| o.data.clone())
            .ok_or(Error::CacheNotFound)?;
        let size = data.len() as u64;
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(len).min(size);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn put_file(
        &self,
        name: &str,
        content_type: &str,
        path: &Path,
        _size: u64,
    ) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.scripted(StoreOp::Put)?;

        let data = tokio::fs::read(path).await?;
        self.put_bytes(name, content_type, data);
        Ok(())
    }

    fn presign_get(
        &self,
        name: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> Result<Url> {
        self.presigns.fetch_add(1, Ordering::Relaxed);
        let url = object_url(&self.endpoint, &self.bucket, name)?;
        self.signer
            .presign("GET", &url, expires_in, &overrides.query_pairs(), Utc::now())
    }
}

// =============================================================================
// Tests
// =============================================================================
