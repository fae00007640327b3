//! goproxy.cn - Redirecting Object-Storage Cache for a Go Module Proxy
//!
//! The cache layer behind a Go module mirror. Artifacts fetched from the
//! upstream proxy are staged on local disk and promoted to S3-compatible
//! object storage in the background. Large immutable artifacts that are
//! already durable are answered with a 302 to a presigned URL instead of
//! being proxied.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ProxyServer                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Redirect   │───▶│    Origin    │───▶│ MirrorCacher │       │
//! │  │    Policy    │    │    Engine    │    │              │       │
//! │  └──────┬───────┘    └──────────────┘    └──────┬───────┘       │
//! │         │                                       │               │
//! │         ▼                                       ▼               │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Storage    │◀───│ ObjectStore  │◀───│    Upload    │       │
//! │  │    Reader    │    │  (S3/SigV4)  │    │  Coalescer   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Object store implementations (S3, in-memory) and signing
//! - [`cache`] - Local staging, coalesced uploads and durable reads
//! - [`domain`] - Artifact metadata and ports
//! - [`engine`] - Upstream origin engine
//! - [`error`] - Error types
//! - [`handler`] - Path normalization, redirect policy and HTTP server
//! - [`metrics`] - Prometheus metrics
//! - [`retry`] - Bounded retry with cancellation

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use adapters::{InMemoryObjectStore, S3Config, S3ObjectStore};
pub use cache::{LocalStagingStore, MirrorCacher, StorageReader, UploadCoalescer};
pub use domain::{Artifact, Cacher, ObjectStore};
pub use engine::{OriginEngine, UpstreamEngine};
pub use error::{Error, Result};
pub use handler::{ProxyServer, RedirectPolicy, ServerConfig};
pub use metrics::ProxyMetrics;
pub use retry::RetryPolicy;
