//! Chunk Store
//!
//! Staging storage for uploaded chunks before assembly. Each upload gets a
//! container keyed by its file hash, holding one slot per chunk key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use super::types::{ChunkKey, UploadError, UploadSession, TEMP_PREFIX};

/// Reader over one stored chunk
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

/// A chunk slot as found in storage
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub key: ChunkKey,
    pub size: u64,
}

/// A chunk container as found in storage
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub file_hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: SystemTime,
}

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Write a chunk, replacing any previous bytes under the same key
    async fn put_chunk(
        &self,
        file_hash: &str,
        key: &ChunkKey,
        data: &[u8],
    ) -> Result<u64, UploadError>;

    /// All chunk slots of a container, unordered. `NotFound` if the container is absent.
    async fn list_chunks(&self, file_hash: &str) -> Result<Vec<StoredChunk>, UploadError>;

    /// Open one chunk for streaming
    async fn open_chunk(&self, file_hash: &str, key: &ChunkKey) -> Result<ChunkReader, UploadError>;

    /// Delete one chunk slot. A missing slot is not an error.
    async fn remove_chunk(&self, file_hash: &str, key: &ChunkKey) -> Result<(), UploadError>;

    /// Delete a container and anything left in it
    async fn remove_container(&self, file_hash: &str) -> Result<(), UploadError>;

    /// Delete a container only if it holds no entries. Returns whether it was removed.
    async fn remove_empty_container(&self, file_hash: &str) -> Result<bool, UploadError>;

    /// Container metadata, `None` if absent
    async fn container_info(&self, file_hash: &str) -> Result<Option<ContainerInfo>, UploadError>;

    /// Every container currently in storage
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, UploadError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Main chunk store with pluggable backends
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Storage backend
    backend: Box<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Box::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with a custom backend
    pub fn with_backend(backend: Box<dyn ChunkStorage>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner { backend }),
        }
    }

    /// Store a chunk. Creates the container on first use.
    pub async fn put(
        &self,
        file_hash: &str,
        key: &ChunkKey,
        data: &[u8],
    ) -> Result<u64, UploadError> {
        let size = self.inner.backend.put_chunk(file_hash, key, data).await?;

        tracing::debug!(
            file_hash = %file_hash,
            chunk_key = %key,
            size = size,
            "Chunk stored"
        );

        Ok(size)
    }

    /// Chunk keys of an upload in merge order
    pub async fn list(&self, file_hash: &str) -> Result<Vec<ChunkKey>, UploadError> {
        Ok(self
            .list_sorted(file_hash)
            .await?
            .into_iter()
            .map(|c| c.key)
            .collect())
    }

    async fn list_sorted(&self, file_hash: &str) -> Result<Vec<StoredChunk>, UploadError> {
        let mut chunks = self.inner.backend.list_chunks(file_hash).await?;
        chunks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(chunks)
    }

    /// Open one chunk for streaming
    pub async fn open(&self, file_hash: &str, key: &ChunkKey) -> Result<ChunkReader, UploadError> {
        self.inner.backend.open_chunk(file_hash, key).await
    }

    /// Delete one chunk slot
    pub async fn remove(&self, file_hash: &str, key: &ChunkKey) -> Result<(), UploadError> {
        self.inner.backend.remove_chunk(file_hash, key).await
    }

    /// Best-effort removal of an upload's container. Failures are only logged.
    pub async fn remove_container(&self, file_hash: &str) {
        match self.inner.backend.remove_container(file_hash).await {
            Ok(()) => tracing::debug!(file_hash = %file_hash, "Removed chunk container"),
            Err(e) => tracing::warn!(
                file_hash = %file_hash,
                error = %e,
                "Failed to remove chunk container"
            ),
        }
    }

    /// Best-effort removal of an emptied container. Anything still inside
    /// (a late or re-uploaded chunk) keeps the container alive.
    pub async fn remove_empty_container(&self, file_hash: &str) {
        match self.inner.backend.remove_empty_container(file_hash).await {
            Ok(true) => tracing::debug!(file_hash = %file_hash, "Removed empty chunk container"),
            Ok(false) => tracing::debug!(
                file_hash = %file_hash,
                "Chunk container not empty, left for stale sweep"
            ),
            Err(e) => tracing::warn!(
                file_hash = %file_hash,
                error = %e,
                "Failed to remove chunk container"
            ),
        }
    }

    /// Summary of what has been staged for an upload
    pub async fn session(&self, file_hash: &str) -> Result<UploadSession, UploadError> {
        let info = self
            .inner
            .backend
            .container_info(file_hash)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("upload {}", file_hash)))?;

        let chunks = self.list_sorted(file_hash).await?;
        let stored_bytes = chunks.iter().map(|c| c.size).sum();

        Ok(UploadSession {
            file_hash: info.file_hash,
            chunks: chunks.into_iter().map(|c| c.key.as_str().to_string()).collect(),
            stored_bytes,
            created_at: info.created_at,
        })
    }

    /// File hashes whose containers have not changed for at least `max_age`
    pub async fn stale_containers(&self, max_age: Duration) -> Result<Vec<String>, UploadError> {
        let now = SystemTime::now();
        Ok(self
            .inner
            .backend
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| {
                now.duration_since(c.modified_at).unwrap_or(Duration::ZERO) >= max_age
            })
            .map(|c| c.file_hash)
            .collect())
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage: `<base>/<file_hash>/<chunk_key>`
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn container_path(&self, file_hash: &str) -> PathBuf {
        self.base_path.join(file_hash)
    }

    fn chunk_path(&self, file_hash: &str, key: &ChunkKey) -> PathBuf {
        self.container_path(file_hash).join(key.as_str())
    }

    fn temp_path(&self, file_hash: &str) -> PathBuf {
        self.container_path(file_hash)
            .join(format!("{}{}.tmp", TEMP_PREFIX, Uuid::new_v4()))
    }
}

fn created_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.created()
        .or_else(|_| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn put_chunk(
        &self,
        file_hash: &str,
        key: &ChunkKey,
        data: &[u8],
    ) -> Result<u64, UploadError> {
        tokio::fs::create_dir_all(self.container_path(file_hash))
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;

        // Write aside and rename so a retried chunk replaces the slot atomically
        let temp_path = self.temp_path(file_hash);
        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, self.chunk_path(file_hash, key)).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(UploadError::StorageError(format!(
                "Failed to write chunk {}: {}",
                key, e
            )));
        }

        Ok(data.len() as u64)
    }

    async fn list_chunks(&self, file_hash: &str) -> Result<Vec<StoredChunk>, UploadError> {
        let dir = self.container_path(file_hash);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound(format!("upload {}", file_hash)));
            }
            Err(e) => return Err(UploadError::StorageError(e.to_string())),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }

            let key = match ChunkKey::parse(&name) {
                Ok(key) => key,
                Err(_) => {
                    tracing::warn!(
                        file_hash = %file_hash,
                        entry = %name,
                        "Ignoring unrecognised entry in chunk container"
                    );
                    continue;
                }
            };

            // The slot may vanish between listing and stat
            let size = match entry.metadata().await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(UploadError::StorageError(e.to_string())),
            };

            chunks.push(StoredChunk { key, size });
        }

        Ok(chunks)
    }

    async fn open_chunk(&self, file_hash: &str, key: &ChunkKey) -> Result<ChunkReader, UploadError> {
        let path = self.chunk_path(file_hash, key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::NotFound(format!("chunk {}/{}", file_hash, key))
            } else {
                UploadError::StorageError(format!("Failed to read chunk: {}", e))
            }
        })?;
        Ok(Box::new(file))
    }

    async fn remove_chunk(&self, file_hash: &str, key: &ChunkKey) -> Result<(), UploadError> {
        match tokio::fs::remove_file(self.chunk_path(file_hash, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::StorageError(e.to_string())),
        }
    }

    async fn remove_container(&self, file_hash: &str) -> Result<(), UploadError> {
        match tokio::fs::remove_dir_all(self.container_path(file_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::StorageError(e.to_string())),
        }
    }

    async fn remove_empty_container(&self, file_hash: &str) -> Result<bool, UploadError> {
        let dir = self.container_path(file_hash);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(UploadError::StorageError(e.to_string())),
        };

        let occupied = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
            .is_some();
        if occupied {
            return Ok(false);
        }

        // remove_dir refuses a directory that gained an entry since the check
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(UploadError::StorageError(e.to_string())),
        }
    }

    async fn container_info(&self, file_hash: &str) -> Result<Option<ContainerInfo>, UploadError> {
        match tokio::fs::metadata(self.container_path(file_hash)).await {
            Ok(meta) if meta.is_dir() => Ok(Some(ContainerInfo {
                file_hash: file_hash.to_string(),
                created_at: created_time(&meta),
                modified_at: meta.modified().unwrap_or_else(|_| SystemTime::now()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::StorageError(e.to_string())),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::StorageError(e.to_string())),
        };

        let mut containers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
        {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_dir() => meta,
                _ => continue,
            };
            containers.push(ContainerInfo {
                file_hash: entry.file_name().to_string_lossy().to_string(),
                created_at: created_time(&meta),
                modified_at: meta.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }

        Ok(containers)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn key(raw: &str) -> ChunkKey {
        ChunkKey::parse(raw).unwrap()
    }

    async fn read_chunk(store: &ChunkStore, file_hash: &str, k: &ChunkKey) -> Vec<u8> {
        let mut reader = store.open(file_hash, k).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn test_put_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("10-x"), b"ten").await.unwrap();
        store.put("H1", &key("2-x"), b"two").await.unwrap();
        store.put("H1", &key("1-x"), b"one").await.unwrap();

        let keys: Vec<String> = store
            .list("H1")
            .await
            .unwrap()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, vec!["1-x", "2-x", "10-x"]);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("0-a"), b"first").await.unwrap();
        store.put("H1", &key("0-a"), b"second").await.unwrap();

        assert_eq!(store.list("H1").await.unwrap().len(), 1);
        assert_eq!(read_chunk(&store, "H1", &key("0-a")).await, b"second");
    }

    #[tokio::test]
    async fn test_list_missing_container() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        let result = store.list("nope").await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_skips_temp_and_foreign_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("0-a"), b"AA").await.unwrap();
        std::fs::write(temp_dir.path().join("H1").join(".0-a.partial.tmp"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("H1").join("notes.txt"), b"x").unwrap();

        assert_eq!(store.list("H1").await.unwrap(), vec![key("0-a")]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("0-a"), b"AA").await.unwrap();
        store.remove("H1", &key("0-a")).await.unwrap();
        store.remove("H1", &key("0-a")).await.unwrap();

        assert!(store.list("H1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_empty_container_keeps_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("0-a"), b"AA").await.unwrap();
        store.remove_empty_container("H1").await;
        assert_eq!(read_chunk(&store, "H1", &key("0-a")).await, b"AA");

        store.remove("H1", &key("0-a")).await.unwrap();
        store.remove_empty_container("H1").await;
        assert!(!temp_dir.path().join("H1").exists());

        // Absent containers are silent either way
        store.remove_empty_container("H1").await;
        store.remove_container("H1").await;
    }

    #[tokio::test]
    async fn test_long_chunk_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        let long = format!("0-{}", "k".repeat(240));
        store.put("H1", &key(&long), b"AA").await.unwrap();
        assert_eq!(read_chunk(&store, "H1", &key(&long)).await, b"AA");
    }

    #[tokio::test]
    async fn test_session_summary() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("1-b"), b"BB").await.unwrap();
        store.put("H1", &key("0-a"), b"AAA").await.unwrap();

        let session = store.session("H1").await.unwrap();
        assert_eq!(session.chunks, vec!["0-a", "1-b"]);
        assert_eq!(session.stored_bytes, 5);

        assert!(matches!(
            store.session("H2").await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_containers() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        store.put("H1", &key("0-a"), b"AA").await.unwrap();

        assert_eq!(store.stale_containers(Duration::ZERO).await.unwrap(), vec!["H1"]);
        assert!(store
            .stale_containers(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
    }
}
