//! Redirect decision policy
//!
//! Decides, per request, whether an artifact is served through the origin
//! engine or the client is sent straight to a signed object-storage URL.
//!
//! ```text
//! Received ─► PathValidated ─┬─► FallThrough            (not an artifact, or disabled)
//!                            └─► CacheLookup ─┬─► Redirect     (hit, size >= min_size)
//!                                             ├─► FallThrough  (hit, size <  min_size)
//!                                             └─► FallThrough  (miss)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::adapters::sigv4::MAX_PRESIGN_EXPIRY;
use crate::cache::StorageReader;
use crate::domain::{ArtifactKind, ResponseOverrides};
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;

/// Redirect policy configuration
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Master switch for automatic redirection
    pub auto_redirect: bool,

    /// Smallest artifact, in bytes, that is redirected rather than proxied
    pub min_size: u64,

    /// Lifetime of the signed URL
    pub expiry: Duration,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            auto_redirect: true,
            min_size: 10 * 1024 * 1024,
            expiry: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of the policy for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    ServeViaEngine,
    RedirectTo { url: Url, expires_at: DateTime<Utc> },
}

// =============================================================================
// Path Handling
// =============================================================================

/// Normalize a raw (percent-encoded) request path into a cache name.
///
/// Rejects malformed escapes, invalid UTF-8, `..` segments in either the raw
/// or decoded form and trailing slashes. `.` and empty segments are dropped.
pub fn normalize_path(raw: &str) -> Result<String> {
    let invalid = |why: &str| Error::InvalidPath(format!("{}: {:?}", why, raw));

    let bytes = raw.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'%' {
            let well_formed = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !well_formed {
                return Err(invalid("malformed percent escape"));
            }
        }
    }

    let decoded = urlencoding::decode(raw).map_err(|_| invalid("path is not valid UTF-8"))?;

    let has_traversal = |p: &str| p.split('/').any(|s| s == "..");
    if has_traversal(raw) || has_traversal(&decoded) {
        return Err(invalid("path traversal"));
    }
    if decoded.contains('\0') {
        return Err(invalid("NUL in path"));
    }
    if decoded.len() > 1 && decoded.ends_with('/') {
        return Err(invalid("trailing slash"));
    }

    Ok(decoded
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/"))
}

/// Reports whether `segment` is in module-proxy escaped form: no uppercase
/// letters, and every `!` followed by a lowercase letter.
fn is_escaped(segment: &str) -> bool {
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c.is_uppercase() {
            return false;
        }
        if c == '!' && !matches!(chars.next(), Some(n) if n.is_ascii_lowercase()) {
            return false;
        }
    }
    true
}

/// Reports whether `name` has the shape of a redirectable artifact:
/// `<module>/@v/<version>.(info|mod|zip)`, outside `sumdb/`.
pub fn is_redirectable(name: &str) -> bool {
    if name.starts_with("sumdb/") {
        return false;
    }
    let Some((module, file)) = name.split_once("/@v/") else {
        return false;
    };
    if module.is_empty() || file.contains('/') {
        return false;
    }
    let Some(kind) = ArtifactKind::from_name(file) else {
        return false;
    };
    let version = &file[..file.len() - kind.suffix().len()];

    !version.is_empty() && is_escaped(module) && is_escaped(version)
}

// =============================================================================
// Policy
// =============================================================================

/// Redirect-vs-serve decisions over the cache-read adapter
pub struct RedirectPolicy {
    config: RedirectConfig,
    reader: StorageReader,
    metrics: ProxyMetrics,
}

impl std::fmt::Debug for RedirectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectPolicy")
            .field("config", &self.config)
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}

impl RedirectPolicy {
    pub fn new(config: RedirectConfig, reader: StorageReader, metrics: ProxyMetrics) -> Result<Self> {
        if config.expiry.is_zero() || config.expiry > MAX_PRESIGN_EXPIRY {
            return Err(Error::Config(format!(
                "redirect expiry must be between 1s and {}s, got {}s",
                MAX_PRESIGN_EXPIRY.as_secs(),
                config.expiry.as_secs()
            )));
        }
        Ok(Self {
            config,
            reader,
            metrics,
        })
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }

    /// Decide for an already normalized cache name.
    #[instrument(skip(self, cx))]
    pub async fn decide(&self, cx: &CancellationToken, name: &str) -> Result<RedirectDecision> {
        if !is_redirectable(name) {
            self.metrics.record_decision("ineligible");
            return Ok(RedirectDecision::ServeViaEngine);
        }
        if !self.config.auto_redirect {
            self.metrics.record_decision("disabled");
            return Ok(RedirectDecision::ServeViaEngine);
        }

        let cache = match self.reader.cache(cx, name).await {
            Ok(cache) => cache,
            Err(Error::CacheNotFound) => {
                debug!("Cache miss, falling through");
                self.metrics.record_decision("miss");
                return Ok(RedirectDecision::ServeViaEngine);
            }
            Err(e) => return Err(e),
        };

        if cache.artifact.size < self.config.min_size {
            debug!(size = cache.artifact.size, "Below redirect threshold");
            self.metrics.record_decision("below_threshold");
            return Ok(RedirectDecision::ServeViaEngine);
        }

        let expiry = self.config.expiry;
        let url = self.reader.store().presign_get(
            name,
            expiry,
            &ResponseOverrides::cacheable_for(expiry),
        )?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expiry).map_err(|e| Error::Internal(e.to_string()))?;

        debug!(size = cache.artifact.size, %expires_at, "Redirecting to durable storage");
        self.metrics.record_decision("redirect");
        Ok(RedirectDecision::RedirectTo { url, expires_at })
    }
}

// =============================================================================
// Tests
// =============================================================================
