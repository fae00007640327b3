//! Local staging store
//!
//! Artifacts produced by the origin are written here first. Each write goes
//! to a uniquely named partial file which is fsynced and renamed into place,
//! so a staged path never holds a torn write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Artifact, Checksum, ContentReader};
use crate::error::{Error, Result};

/// Prefix of the per-process scratch directory
pub const SCRATCH_PREFIX: &str = "goproxy-cn-local-caches";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Staging configuration
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Directory the scratch root is created in; the system temp dir if unset
    pub parent_dir: Option<PathBuf>,

    /// Pause between cleanup attempts
    pub cleanup_interval: Duration,

    /// Maximum cleanup attempts at shutdown
    pub cleanup_attempts: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            parent_dir: None,
            cleanup_interval: Duration::from_secs(1),
            cleanup_attempts: 60,
        }
    }
}

/// Lifecycle of a staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedState {
    Pending,
    Removed,
}

/// A fully written local copy of an artifact awaiting promotion.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub artifact: Artifact,
    state: StagedState,
}

impl StagedFile {
    pub fn state(&self) -> StagedState {
        self.state
    }

    pub async fn exists(&self) -> bool {
        self.state == StagedState::Pending
            && tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Delete the local file. Already-missing files count as removed.
    pub async fn remove(&mut self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state = StagedState::Removed;
        Ok(())
    }
}

/// Scratch-directory store for staged artifacts
#[derive(Debug)]
pub struct LocalStagingStore {
    root: PathBuf,
    config: StagingConfig,
}

impl LocalStagingStore {
    /// Create the scratch root under the configured parent directory.
    pub fn new(config: StagingConfig) -> Result<Self> {
        let parent = config
            .parent_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)?;

        let root = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&parent)?
            .keep();
        info!(root = %root.display(), "Created local staging root");

        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final staged location for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(name.as_bytes())))
    }

    /// Stream `content` into the store, returning the staged file with its
    /// measured size and checksum.
    #[instrument(skip(self, cx, artifact, content), fields(name = %artifact.name()))]
    pub async fn stage(
        &self,
        cx: &CancellationToken,
        mut artifact: Artifact,
        content: ContentReader,
    ) -> Result<StagedFile> {
        let final_path = self.path_for(artifact.name());
        let partial = final_path.with_file_name(format!(
            "{}.{}.partial",
            final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));

        let (size, checksum) = match write_partial(cx, &partial, content).await {
            Ok(measured) => measured,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, &final_path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        artifact.size = size;
        artifact.checksum = checksum;
        debug!(size, path = %final_path.display(), "Staged artifact");

        Ok(StagedFile {
            path: final_path,
            artifact,
            state: StagedState::Pending,
        })
    }

    /// Best-effort removal of the scratch root, retried a bounded number of
    /// times. Returns whether the root is gone.
    pub async fn cleanup(&self) -> bool {
        let attempts = self.config.cleanup_attempts.max(1);
        for attempt in 1..=attempts {
            match tokio::fs::remove_dir_all(&self.root).await {
                Ok(()) => {
                    info!(root = %self.root.display(), "Removed local staging root");
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to remove local staging root");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.cleanup_interval).await;
            }
        }
        warn!(root = %self.root.display(), "Giving up on local staging root cleanup");
        false
    }
}

async fn write_partial(
    cx: &CancellationToken,
    path: &Path,
    mut content: ContentReader,
) -> Result<(u64, Checksum)> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = md5::Context::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = tokio::select! {
            _ = cx.cancelled() => return Err(Error::Cancelled),
            n = content.read(&mut buf) => n?,
        };
        if n == 0 {
            break;
        }
        hasher.consume(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((size, Checksum::from(hasher.compute())))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    fn store_in(dir: &Path) -> LocalStagingStore {
        LocalStagingStore::new(StagingConfig {
            parent_dir: Some(dir.to_path_buf()),
            cleanup_interval: Duration::from_millis(10),
            cleanup_attempts: 3,
        })
        .unwrap()
    }

    /// Yields some bytes, then fails.
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(std::io::Error::other("upstream reset")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_new_creates_prefixed_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(store.root().is_dir());
        assert!(store
            .root()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCRATCH_PREFIX));
    }

    #[test]
    fn test_two_stores_get_distinct_roots() {
        let dir = tempfile::tempdir().unwrap();
        assert_ne!(store_in(dir.path()).root(), store_in(dir.path()).root());
    }

    #[tokio::test]
    async fn test_stage_measures_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cx = CancellationToken::new();

        let staged = store
            .stage(
                &cx,
                Artifact::new("example.com/mod/@v/v1.0.0.mod"),
                Box::new(Cursor::new(b"module example.com/mod\n".to_vec())),
            )
            .await
            .unwrap();

        assert_eq!(staged.path, store.path_for("example.com/mod/@v/v1.0.0.mod"));
        assert_eq!(staged.artifact.size, 23);
        assert_eq!(
            staged.artifact.checksum,
            Checksum::compute(b"module example.com/mod\n")
        );
        assert_eq!(staged.state(), StagedState::Pending);
        assert!(staged.exists().await);
        assert_eq!(
            tokio::fs::read(&staged.path).await.unwrap(),
            b"module example.com/mod\n"
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cx = CancellationToken::new();

        let result = store
            .stage(
                &cx,
                Artifact::new("a/@v/v1.0.0.zip"),
                Box::new(FailingReader { sent: false }),
            )
            .await;

        assert_matches!(result, Err(Error::Io(_)));
        let mut entries = tokio::fs::read_dir(store.root()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_stage_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cx = CancellationToken::new();
        cx.cancel();

        let result = store
            .stage(
                &cx,
                Artifact::new("a/@v/v1.0.0.zip"),
                Box::new(Cursor::new(vec![0u8; 10])),
            )
            .await;

        assert_matches!(result, Err(Error::Cancelled));
        assert!(!store.path_for("a/@v/v1.0.0.zip").exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cx = CancellationToken::new();

        let mut staged = store
            .stage(&cx, Artifact::new("a/@v/v1.0.0.info"), Box::new(Cursor::new(b"{}".to_vec())))
            .await
            .unwrap();

        staged.remove().await.unwrap();
        staged.remove().await.unwrap();
        assert_eq!(staged.state(), StagedState::Removed);
        assert!(!staged.exists().await);
    }

    #[tokio::test]
    async fn test_cleanup_removes_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cx = CancellationToken::new();
        store
            .stage(&cx, Artifact::new("a/@v/v1.0.0.info"), Box::new(Cursor::new(b"{}".to_vec())))
            .await
            .unwrap();

        assert!(store.cleanup().await);
        assert!(!store.root().exists());
        assert!(store.cleanup().await);
    }
}
