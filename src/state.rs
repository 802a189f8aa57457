//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::{ArtifactStore, ChunkStore, DedupIndex, MergeCoordinator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    chunk_store: ChunkStore,
    artifacts: ArtifactStore,
    dedup: DedupIndex,
    merger: MergeCoordinator,
}

impl AppState {
    /// Wire up the upload engine over local chunk and artifact directories
    pub fn new(config: Config) -> Self {
        let chunk_store = ChunkStore::with_local_storage(config.storage.chunk_dir.clone());
        let artifacts = ArtifactStore::new(config.storage.artifact_dir.clone());
        let dedup = DedupIndex::new(artifacts.clone());
        let merger = MergeCoordinator::new(
            chunk_store.clone(),
            artifacts.clone(),
            config.upload.cleanup_delay(),
            config.storage.public_path.clone(),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                chunk_store,
                artifacts,
                dedup,
                merger,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.inner.dedup
    }

    pub fn merger(&self) -> &MergeCoordinator {
        &self.inner.merger
    }
}
