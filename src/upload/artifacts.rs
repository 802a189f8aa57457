//! Artifact Store
//!
//! The flat directory of completed uploads, keyed by file name.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::types::{validate_segment, ArtifactInfo, UploadError, TEMP_PREFIX};

/// Completed-artifact directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the path of a named artifact
    pub fn path(&self, name: &str) -> Result<PathBuf, UploadError> {
        validate_segment("fileName", name)?;
        Ok(self.root.join(name))
    }

    /// Look up an artifact by name
    pub async fn stat(&self, name: &str) -> Result<Option<ArtifactInfo>, UploadError> {
        let path = self.path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(artifact_info(name.to_string(), &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::StorageError(e.to_string())),
        }
    }

    /// All completed artifacts, sorted by name.
    ///
    /// In-flight merge output is hidden until it is renamed into place.
    pub async fn list(&self) -> Result<Vec<ArtifactInfo>, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::StorageError(e.to_string())),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }

            match entry.metadata().await {
                Ok(meta) if meta.is_file() => artifacts.push(artifact_info(name, &meta)),
                _ => continue,
            }
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }
}

fn artifact_info(name: String, meta: &std::fs::Metadata) -> ArtifactInfo {
    let create_time = meta
        .created()
        .or_else(|_| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    ArtifactInfo {
        name,
        size: meta.len(),
        create_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());

        std::fs::write(temp_dir.path().join("b.bin"), b"BBBB").unwrap();
        std::fs::write(temp_dir.path().join("a.bin"), b"AA").unwrap();
        std::fs::write(temp_dir.path().join(".a.bin.merging"), b"xx").unwrap();
        std::fs::create_dir(temp_dir.path().join("subdir")).unwrap();

        let listed = store.list().await.unwrap();
        let names: Vec<&str> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
        assert_eq!(listed[1].size, 4);
    }

    #[tokio::test]
    async fn test_list_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().join("not-yet"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stat() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());
        std::fs::write(temp_dir.path().join("a.bin"), b"AA").unwrap();

        assert_eq!(store.stat("a.bin").await.unwrap().unwrap().size, 2);
        assert!(store.stat("missing.bin").await.unwrap().is_none());
        assert!(matches!(
            store.stat("../a.bin").await,
            Err(UploadError::ValidationError(_))
        ));
    }
}
