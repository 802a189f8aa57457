//! Merge Coordinator
//!
//! Assembles the staged chunks of an upload into its final artifact.
//!
//! Merge order:
//! 1. Take the per-upload merge lock (a second merge is rejected)
//! 2. List chunks, sorted by numeric key prefix
//! 3. Stream every chunk, in order, into a hidden temporary file
//! 4. Flush, sync and check the size against the declared size
//! 5. Rename the temporary file into place
//! 6. Only then delete the chunks and schedule container cleanup
//!
//! A merge that fails before step 5 leaves every chunk in place and can be
//! retried. An artifact is never visible half-written.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::artifacts::ArtifactStore;
use super::chunk_store::ChunkStore;
use super::types::{
    validate_segment, ArtifactRef, ChunkKey, UploadError, STREAM_BUFFER_SIZE, TEMP_PREFIX,
};

// ============================================================================
// Merge Locks
// ============================================================================

/// Set of file hashes with a merge in flight
#[derive(Clone, Default)]
pub struct MergeLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the merge slot for `file_hash`, or `None` if it is taken
    pub fn try_acquire(&self, file_hash: &str) -> Option<MergeGuard> {
        let mut active = self.active.lock();
        if !active.insert(file_hash.to_string()) {
            return None;
        }
        Some(MergeGuard {
            locks: self.clone(),
            file_hash: file_hash.to_string(),
        })
    }

    pub fn is_active(&self, file_hash: &str) -> bool {
        self.active.lock().contains(file_hash)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Releases the merge slot when dropped
pub struct MergeGuard {
    locks: MergeLocks,
    file_hash: String,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.locks.active.lock().remove(&self.file_hash);
    }
}

// ============================================================================
// Merge Coordinator
// ============================================================================

#[derive(Clone)]
pub struct MergeCoordinator {
    inner: Arc<MergeCoordinatorInner>,
}

struct MergeCoordinatorInner {
    chunk_store: ChunkStore,
    artifacts: ArtifactStore,
    locks: MergeLocks,

    /// Delay before the emptied chunk container is removed
    cleanup_delay: Duration,

    /// URL prefix under which artifacts are published
    public_path: String,
}

impl MergeCoordinator {
    pub fn new(
        chunk_store: ChunkStore,
        artifacts: ArtifactStore,
        cleanup_delay: Duration,
        public_path: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(MergeCoordinatorInner {
                chunk_store,
                artifacts,
                locks: MergeLocks::new(),
                cleanup_delay,
                public_path: public_path.into(),
            }),
        }
    }

    pub fn locks(&self) -> &MergeLocks {
        &self.inner.locks
    }

    /// Assemble every staged chunk of `file_hash` into the artifact `file_name`
    pub async fn merge(
        &self,
        file_hash: &str,
        file_name: &str,
        declared_size: u64,
    ) -> Result<ArtifactRef, UploadError> {
        validate_segment("fileHash", file_hash)?;
        let dest = self.inner.artifacts.path(file_name)?;

        let _guard = self
            .inner
            .locks
            .try_acquire(file_hash)
            .ok_or_else(|| UploadError::MergeInProgress(file_hash.to_string()))?;

        let keys = match self.inner.chunk_store.list(file_hash).await {
            Ok(keys) => keys,
            Err(UploadError::NotFound(_)) => {
                return Err(UploadError::NoChunks(file_hash.to_string()));
            }
            Err(e) => return Err(e),
        };
        if keys.is_empty() {
            return Err(UploadError::NoChunks(file_hash.to_string()));
        }

        warn_on_shared_indices(file_hash, &keys);

        tracing::info!(
            file_hash = %file_hash,
            file_name = %file_name,
            chunks = keys.len(),
            "Assembling file from chunks"
        );

        tokio::fs::create_dir_all(self.inner.artifacts.root())
            .await
            .map_err(|e| UploadError::StorageError(format!("Artifact directory unavailable: {}", e)))?;

        let temp_path = self
            .inner
            .artifacts
            .root()
            .join(format!("{}{}.merging", TEMP_PREFIX, Uuid::new_v4()));

        let written = match self.write_artifact(file_hash, &keys, &temp_path).await {
            Ok(written) => written,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };

        if written != declared_size {
            discard(&temp_path).await;
            tracing::warn!(
                file_hash = %file_hash,
                declared_size = declared_size,
                written = written,
                "Assembled size does not match declared size, chunks kept"
            );
            return Err(UploadError::SizeMismatch {
                expected: declared_size,
                actual: written,
            });
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &dest).await {
            discard(&temp_path).await;
            return Err(UploadError::StorageError(format!(
                "Failed to publish artifact {}: {}",
                file_name, e
            )));
        }

        // The artifact is complete; chunk state can go
        for key in &keys {
            if let Err(e) = self.inner.chunk_store.remove(file_hash, key).await {
                tracing::warn!(
                    file_hash = %file_hash,
                    chunk_key = %key,
                    error = %e,
                    "Failed to remove merged chunk"
                );
            }
        }
        self.schedule_container_cleanup(file_hash.to_string());

        tracing::info!(
            file_hash = %file_hash,
            file_name = %file_name,
            size = written,
            "File assembled successfully"
        );

        Ok(ArtifactRef {
            file_name: file_name.to_string(),
            size: written,
            url: format!(
                "{}/{}",
                self.inner.public_path.trim_end_matches('/'),
                urlencoding::encode(file_name)
            ),
        })
    }

    /// Single sequential writer: chunks are appended strictly in key order
    async fn write_artifact(
        &self,
        file_hash: &str,
        keys: &[ChunkKey],
        temp_path: &Path,
    ) -> Result<u64, UploadError> {
        let file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to create artifact: {}", e)))?;
        let mut writer = tokio::io::BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);

        let mut written: u64 = 0;
        for key in keys {
            let mut reader = self.inner.chunk_store.open(file_hash, key).await?;
            written += tokio::io::copy(&mut reader, &mut writer).await.map_err(|e| {
                UploadError::StorageError(format!("Failed to append chunk {}: {}", key, e))
            })?;
        }

        writer
            .flush()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;

        Ok(written)
    }

    /// Remove the emptied chunk container after the cleanup delay.
    ///
    /// Skipped while another merge of the same upload holds the lock, and a
    /// container that gained chunks in the meantime is left alone.
    pub fn schedule_container_cleanup(&self, file_hash: String) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.inner.cleanup_delay).await;

            let Some(_guard) = coordinator.inner.locks.try_acquire(&file_hash) else {
                tracing::debug!(
                    file_hash = %file_hash,
                    "Merge in progress, skipping container cleanup"
                );
                return;
            };
            coordinator.inner.chunk_store.remove_empty_container(&file_hash).await;
        })
    }

    /// Remove chunk containers untouched for `max_age`, skipping uploads being merged
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, UploadError> {
        let stale = self.inner.chunk_store.stale_containers(max_age).await?;

        let mut removed = 0;
        for file_hash in stale {
            let Some(_guard) = self.inner.locks.try_acquire(&file_hash) else {
                continue;
            };
            self.inner.chunk_store.remove_container(&file_hash).await;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(count = removed, "Cleaned up stale uploads");
        }

        Ok(removed)
    }

    /// Start background sweep of abandoned uploads
    pub fn start_sweep_task(self, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stale(max_age).await {
                    tracing::warn!(error = %e, "Stale upload sweep failed");
                }
            }
        })
    }
}

/// Two keys with the same index are both kept, lexically later key last
fn warn_on_shared_indices(file_hash: &str, keys: &[ChunkKey]) {
    for pair in keys.windows(2) {
        if pair[0].index() == pair[1].index() {
            tracing::warn!(
                file_hash = %file_hash,
                first = %pair[0],
                second = %pair[1],
                "Chunk keys share a numeric index"
            );
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard partial artifact");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
