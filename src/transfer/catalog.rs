//! Artifact Catalog
//!
//! Records of completed, merged files and ownership of their backing
//! bytes. Records stay until the sweeper reclaims them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::chunk_store::ChunkStore;
use super::token::is_safe_key;
use super::types::{Artifact, TransferError, UploadSession};
use crate::persistence::StateStore;

/// An artifact together with an open handle on its bytes
#[derive(Debug)]
pub struct OpenedArtifact {
    pub artifact: Artifact,
    pub file: tokio::fs::File,
}

/// Catalog of completed artifacts
#[derive(Clone)]
pub struct ArtifactCatalog {
    inner: Arc<ArtifactCatalogInner>,
}

struct ArtifactCatalogInner {
    artifacts: RwLock<HashMap<String, Artifact>>,
    artifact_dir: PathBuf,
    state_store: Arc<dyn StateStore>,
}

impl ArtifactCatalog {
    pub fn new(artifact_dir: PathBuf, state_store: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(ArtifactCatalogInner {
                artifacts: RwLock::new(HashMap::new()),
                artifact_dir,
                state_store,
            }),
        }
    }

    /// Replace in-memory records with previously persisted ones
    pub async fn restore(&self, artifacts: HashMap<String, Artifact>) {
        *self.inner.artifacts.write().await = artifacts;
    }

    /// Where the merged bytes for `file_id` live
    pub fn artifact_path(&self, file_id: &str) -> Result<PathBuf, TransferError> {
        if !is_safe_key(file_id) {
            return Err(TransferError::Storage(format!("Unsafe file id: {:?}", file_id)));
        }
        Ok(self.inner.artifact_dir.join(format!("{}.bin", file_id)))
    }

    /// Merge a session's chunks into a new artifact and record it
    pub async fn ingest(
        &self,
        session: &UploadSession,
        chunks: &ChunkStore,
    ) -> Result<Artifact, TransferError> {
        let storage_path = self.artifact_path(&session.file_id)?;
        let merged = chunks
            .merge_into(&session.file_id, session.chunk_count(), &storage_path)
            .await?;

        let artifact = Artifact {
            file_id: session.file_id.clone(),
            filename: session.filename.clone(),
            storage_path,
            size_bytes: merged.size_bytes,
            sha256: merged.sha256,
            created_at: Utc::now(),
        };

        if let Err(e) = self.record(artifact.clone()).await {
            let _ = tokio::fs::remove_file(&artifact.storage_path).await;
            return Err(e);
        }

        Ok(artifact)
    }

    /// Persist and insert an artifact record
    pub async fn record(&self, artifact: Artifact) -> Result<(), TransferError> {
        let mut artifacts = self.inner.artifacts.write().await;
        self.inner.state_store.put_artifact(&artifact).await?;

        tracing::info!(
            file_id = %artifact.file_id,
            filename = %artifact.filename,
            size = artifact.size_bytes,
            "Recorded artifact"
        );

        artifacts.insert(artifact.file_id.clone(), artifact);
        Ok(())
    }

    pub async fn get(&self, file_id: &str) -> Option<Artifact> {
        self.inner.artifacts.read().await.get(file_id).cloned()
    }

    pub async fn contains(&self, file_id: &str) -> bool {
        self.inner.artifacts.read().await.contains_key(file_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Open an artifact's bytes for streaming.
    ///
    /// Fails with `NotFound` if the record or its backing file is gone.
    pub async fn open(&self, file_id: &str) -> Result<OpenedArtifact, TransferError> {
        let artifact = self
            .get(file_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("artifact {}", file_id)))?;

        let file = match tokio::fs::File::open(&artifact.storage_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(format!(
                    "backing file missing for {}",
                    file_id
                )));
            }
            Err(e) => return Err(TransferError::Storage(e.to_string())),
        };

        Ok(OpenedArtifact { artifact, file })
    }

    /// Delete an artifact's bytes and its record.
    ///
    /// Returns whether a backing file was actually removed; an already
    /// missing file is not an error. The in-memory record is dropped last,
    /// so a failed reclaim stays visible and is retried by the next sweep.
    pub async fn reclaim(&self, file_id: &str) -> Result<bool, TransferError> {
        let path = match self.get(file_id).await {
            Some(artifact) => artifact.storage_path,
            None => self.artifact_path(file_id)?,
        };

        let deleted = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(TransferError::Storage(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        self.inner.state_store.delete_artifact(file_id).await?;
        self.inner.artifacts.write().await.remove(file_id);

        tracing::debug!(file_id = %file_id, file_deleted = deleted, "Reclaimed artifact");
        Ok(deleted)
    }

    /// Artifacts recorded before `cutoff` whose file ID is not in `referenced`
    pub async fn unreferenced(
        &self,
        referenced: &HashSet<String>,
        cutoff: DateTime<Utc>,
    ) -> Vec<Artifact> {
        self.inner
            .artifacts
            .read()
            .await
            .values()
            .filter(|artifact| {
                artifact.created_at < cutoff && !referenced.contains(&artifact.file_id)
            })
            .cloned()
            .collect()
    }
}
