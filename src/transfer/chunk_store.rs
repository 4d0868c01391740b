//! Chunk Store
//!
//! Temporary storage for uploaded chunks before assembly, keyed by
//! `(file_id, chunk_id)`. Merging streams the chunks in ascending order
//! into one output file without holding the whole file in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::token::is_safe_key;
use super::types::TransferError;

/// Read buffer used while merging
const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Boxed reader over one stored chunk
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Create the storage area for a session
    async fn prepare_session(&self, file_id: &str) -> Result<(), TransferError>;

    /// Store a chunk, returning its storage reference
    async fn store_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        data: &[u8],
    ) -> Result<String, TransferError>;

    /// Open a stored chunk for reading
    async fn open_chunk(&self, file_id: &str, chunk_id: usize) -> Result<ChunkReader, TransferError>;

    /// Delete all chunks for a session. Missing files are not an error.
    async fn delete_session_chunks(&self, file_id: &str) -> Result<usize, TransferError>;
}

/// Size and digest of a merged file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFile {
    pub size_bytes: u64,
    pub sha256: String,
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

    pub async fn prepare_session(&self, file_id: &str) -> Result<(), TransferError> {
        self.inner.backend.prepare_session(file_id).await
    }

    pub async fn store_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        data: &[u8],
    ) -> Result<String, TransferError> {
        self.inner.backend.store_chunk(file_id, chunk_id, data).await
    }

    pub async fn open_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
    ) -> Result<ChunkReader, TransferError> {
        self.inner.backend.open_chunk(file_id, chunk_id).await
    }

    pub async fn delete_session_chunks(&self, file_id: &str) -> Result<usize, TransferError> {
        self.inner.backend.delete_session_chunks(file_id).await
    }

    /// Concatenate chunks `0..chunk_count` into `dest`.
    ///
    /// The output is written next to `dest` and renamed into place, so a
    /// failed merge never leaves a truncated file at `dest`.
    pub async fn merge_into(
        &self,
        file_id: &str,
        chunk_count: usize,
        dest: &Path,
    ) -> Result<MergedFile, TransferError> {
        let partial = dest.with_extension("merging");

        match self.write_merged(file_id, chunk_count, &partial).await {
            Ok(merged) => {
                tokio::fs::rename(&partial, dest)
                    .await
                    .map_err(|e| TransferError::Storage(format!("Failed to finalize merge: {}", e)))?;

                tracing::debug!(
                    file_id = %file_id,
                    chunks = chunk_count,
                    size = merged.size_bytes,
                    "Merged chunks"
                );
                Ok(merged)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn write_merged(
        &self,
        file_id: &str,
        chunk_count: usize,
        path: &Path,
    ) -> Result<MergedFile, TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Storage(e.to_string()))?;
        }

        let mut out = tokio::fs::File::create(path)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;

        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        let mut buf = vec![0u8; MERGE_BUFFER_SIZE];

        for chunk_id in 0..chunk_count {
            let mut reader = self.open_chunk(file_id, chunk_id).await?;
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| TransferError::Storage(format!("Failed to read chunk {}: {}", chunk_id, e)))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])
                    .await
                    .map_err(|e| TransferError::Storage(e.to_string()))?;
                size_bytes += n as u64;
            }
        }

        out.flush()
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        out.sync_all()
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;

        Ok(MergedFile {
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn session_dir(&self, file_id: &str) -> Result<PathBuf, TransferError> {
        if !is_safe_key(file_id) {
            return Err(TransferError::Storage(format!("Unsafe file id: {:?}", file_id)));
        }
        Ok(self.base_path.join("chunks").join(file_id))
    }

    fn chunk_name(chunk_id: usize) -> String {
        format!("{:08}.chunk", chunk_id)
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn prepare_session(&self, file_id: &str) -> Result<(), TransferError> {
        let dir = self.session_dir(file_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))
    }

    async fn store_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        data: &[u8],
    ) -> Result<String, TransferError> {
        let dir = self.session_dir(file_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;

        let name = Self::chunk_name(chunk_id);
        let path = dir.join(&name);
        let temp_path = dir.join(format!("{}.tmp.{}", name, Uuid::new_v4().simple()));

        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(TransferError::Storage(format!(
                "Failed to write chunk {}: {}",
                chunk_id, e
            )));
        }

        Ok(name)
    }

    async fn open_chunk(&self, file_id: &str, chunk_id: usize) -> Result<ChunkReader, TransferError> {
        let path = self.session_dir(file_id)?.join(Self::chunk_name(chunk_id));
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransferError::Storage(format!("Failed to open chunk {}: {}", chunk_id, e)))?;
        Ok(Box::new(file))
    }

    async fn delete_session_chunks(&self, file_id: &str) -> Result<usize, TransferError> {
        let session_dir = self.session_dir(file_id)?;

        let mut entries = match tokio::fs::read_dir(&session_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(TransferError::Storage(e.to_string())),
        };

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?
        {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => count += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        file_id = %file_id,
                        path = %entry.path().display(),
                        error = %e,
                        "Failed to delete chunk file"
                    );
                }
            }
        }

        // Remove empty directory
        let _ = tokio::fs::remove_dir(&session_dir).await;

        Ok(count)
    }
}

// ============================================================================
// Tests
// ============================================================================
