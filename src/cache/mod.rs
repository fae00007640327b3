//! Redirecting object-storage cache layer
//!
//! Composes the three cache components behind the [`Cacher`] capability that
//! the origin engine consumes.
//!
//! - **Staging** (`staging.rs`) - local scratch files with atomic writes
//! - **Uploader** (`uploader.rs`) - coalesced background promotion
//! - **Reader** (`reader.rs`) - durable lookups and ranged reads
//!
//! ```text
//!   set_cache ──► claim ──► LocalStagingStore ──► UploadCoalescer ──► ObjectStore
//!   cache ─────────────────────────────────────► StorageReader ────► ObjectStore
//! ```

pub mod reader;
pub mod staging;
pub mod uploader;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use reader::{Cache, ObjectReader, StorageReader};
pub use staging::{LocalStagingStore, StagedFile, StagedState, StagingConfig};
pub use uploader::{Claim, UploadCoalescer, UploaderConfig, UploaderStats};

use crate::domain::{Artifact, Cacher, ContentReader};
use crate::error::Result;

/// The engine-facing cacher
pub struct MirrorCacher {
    reader: StorageReader,
    staging: Arc<LocalStagingStore>,
    coalescer: Arc<UploadCoalescer>,
}

impl MirrorCacher {
    pub fn new(
        reader: StorageReader,
        staging: Arc<LocalStagingStore>,
        coalescer: Arc<UploadCoalescer>,
    ) -> Self {
        Self {
            reader,
            staging,
            coalescer,
        }
    }

    pub fn reader(&self) -> &StorageReader {
        &self.reader
    }

    pub fn staging(&self) -> &Arc<LocalStagingStore> {
        &self.staging
    }

    pub fn coalescer(&self) -> &Arc<UploadCoalescer> {
        &self.coalescer
    }
}

#[async_trait]
impl Cacher for MirrorCacher {
    async fn cache(&self, cx: &CancellationToken, name: &str) -> Result<Cache> {
        self.reader.cache(cx, name).await
    }

    async fn set_cache(
        &self,
        cx: &CancellationToken,
        artifact: Artifact,
        content: ContentReader,
    ) -> Result<()> {
        let Some(claim) = self.coalescer.claim(artifact.name()) else {
            debug!(name = artifact.name(), "Artifact already being cached, discarding");
            return Ok(());
        };

        let staged = self.staging.stage(cx, artifact, content).await?;
        claim.commit(staged);
        Ok(())
    }
}
