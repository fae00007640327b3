//! Domain Layer
//!
//! Value objects and ports shared by the cache layer, the HTTP front door
//! and the storage adapters.
//!
//! - **Artifact** (`artifact.rs`) - cache content metadata and checksums
//! - **Ports** (`ports.rs`) - trait abstractions for durable storage and the
//!   engine-facing cache capability
//!
//! # Usage
//!
//! ```ignore
//! use goproxy_cn::domain::{Artifact, Cacher, ObjectStore};
//!
//! async fn warm<C: Cacher>(cacher: &C, cx: &CancellationToken, body: Vec<u8>) -> Result<()> {
//!     let artifact = Artifact::new("example.com/mod/@v/v1.0.0.mod");
//!     cacher.set_cache(cx, artifact, Box::new(std::io::Cursor::new(body))).await
//! }
//! ```

pub mod artifact;
pub mod ports;

pub use artifact::{mime_type_for, Artifact, ArtifactKind, Checksum, CHECKSUM_LEN};
pub use ports::{Cacher, ContentReader, ObjectInfo, ObjectStore, ResponseOverrides};
