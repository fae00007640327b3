//! Infrastructure Adapters
//!
//! Implementations of the [`ObjectStore`](crate::domain::ObjectStore) port,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │              ObjectStore │ Cacher (Traits)                  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ S3ObjectStore │ InMemoryObjectStore │ SigV4Signer          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use goproxy_cn::adapters::{S3Config, S3ObjectStore};
//! use goproxy_cn::domain::ObjectStore;
//!
//! let store = S3ObjectStore::new(S3Config::default())?;
//! let info = store.stat("example.com/mod/@v/v1.0.0.zip").await?;
//! ```

pub mod memory;
pub mod s3;
pub mod sigv4;

pub use memory::{InMemoryObjectStore, MemoryStoreStats, StoreOp};
pub use s3::{S3Config, S3ObjectStore};
pub use sigv4::{SigV4Signer, MAX_PRESIGN_EXPIRY};
