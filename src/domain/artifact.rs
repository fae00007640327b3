//! Artifact value objects
//!
//! An artifact is a named, write-once unit of module proxy cache content:
//! the `.info`, `.mod` or `.zip` file for one module version.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Width of an artifact checksum in bytes.
pub const CHECKSUM_LEN: usize = 16;

// =============================================================================
// Artifact Kind
// =============================================================================

/// File kind of a module proxy artifact, derived from its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArtifactKind {
    Info,
    Mod,
    Zip,
}

impl ArtifactKind {
    /// Kind for a cache name, if its suffix is a known artifact suffix.
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "info" => Some(Self::Info),
            "mod" => Some(Self::Mod),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Content type served for this kind.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Info => "application/json; charset=utf-8",
            Self::Mod => "text/plain; charset=utf-8",
            Self::Zip => "application/zip",
        }
    }

    /// File suffix including the leading dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Info => ".info",
            Self::Mod => ".mod",
            Self::Zip => ".zip",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix()[1..])
    }
}

/// Content type for an arbitrary cache name.
pub fn mime_type_for(name: &str) -> &'static str {
    ArtifactKind::from_name(name)
        .map(|k| k.mime_type())
        .unwrap_or("application/octet-stream")
}

// =============================================================================
// Checksum
// =============================================================================

/// Fixed-width content digest (MD5 width, matching single-part S3 ETags).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(pub [u8; CHECKSUM_LEN]);

impl Checksum {
    /// Digest of an in-memory buffer.
    pub fn compute(data: impl AsRef<[u8]>) -> Self {
        Self(md5::compute(data).0)
    }

    /// Derive a checksum from a backend entity tag.
    ///
    /// A tag that is already a hex digest of the expected width is decoded
    /// as-is; anything else (multipart tags, opaque hashes) is hashed.
    pub fn from_etag(etag: &str) -> Self {
        let tag = etag.trim().trim_start_matches("W/").trim_matches('"');
        if tag.len() == CHECKSUM_LEN * 2 {
            let mut out = [0u8; CHECKSUM_LEN];
            if hex::decode_to_slice(tag, &mut out).is_ok() {
                return Self(out);
            }
        }
        Self::compute(tag.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Quoted base64 form used for the `ETag` header.
    pub fn etag(&self) -> String {
        format!("\"{}\"", general_purpose::STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl From<md5::Digest> for Checksum {
    fn from(d: md5::Digest) -> Self {
        Self(d.0)
    }
}

// =============================================================================
// Artifact
// =============================================================================

/// Logical unit of cache content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    name: String,
    /// Content type inferred from the file kind
    pub mime_type: String,
    /// Byte length, known once fully written
    pub size: u64,
    /// Creation or modification time
    pub mod_time: DateTime<Utc>,
    /// Content digest
    pub checksum: Checksum,
}

impl Artifact {
    /// A fresh artifact whose size and checksum are filled in once written.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            mime_type: mime_type_for(&name).to_string(),
            name,
            size: 0,
            mod_time: Utc::now(),
            checksum: Checksum::default(),
        }
    }

    /// Fully described artifact.
    pub fn with_metadata(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        mod_time: DateTime<Utc>,
        checksum: Checksum,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            mod_time,
            checksum,
        }
    }

    /// Cache key. Immutable once assigned.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Option<ArtifactKind> {
        ArtifactKind::from_name(&self.name)
    }

    /// `Last-Modified` header value.
    pub fn last_modified(&self) -> String {
        self.mod_time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
