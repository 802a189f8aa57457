//! Deduplication Index
//!
//! Enables instant uploads: a completed artifact with the same name and byte
//! size is taken to be the same file. Content is not re-hashed here; clients
//! that need certainty call verify afterwards.

use super::artifacts::ArtifactStore;
use super::types::{DedupResult, UploadError};

/// Name-and-size lookup over completed artifacts
#[derive(Clone)]
pub struct DedupIndex {
    artifacts: ArtifactStore,
}

impl DedupIndex {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }

    /// Check whether an artifact named `file_name` with exactly `size` bytes exists.
    ///
    /// A name reused for a different size is reported as not found.
    pub async fn exists(&self, file_name: &str, size: u64) -> Result<DedupResult, UploadError> {
        let existing = self.artifacts.stat(file_name).await?;

        match existing {
            Some(info) if info.size == size => {
                tracing::info!(
                    file_name = %file_name,
                    size = size,
                    "Duplicate file detected - instant upload"
                );
                Ok(DedupResult {
                    found: true,
                    metadata: Some(info),
                })
            }
            Some(info) => {
                tracing::debug!(
                    file_name = %file_name,
                    declared_size = size,
                    stored_size = info.size,
                    "Name matches but size differs"
                );
                Ok(DedupResult {
                    found: false,
                    metadata: None,
                })
            }
            None => Ok(DedupResult {
                found: false,
                metadata: None,
            }),
        }
    }
}
