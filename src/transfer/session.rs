//! Upload Session Registry
//!
//! Tracks in-progress uploads with:
//! - One exclusive lock per session, serializing its chunk writes and finish
//! - Write-through persistence of every session mutation
//! - Reclamation of abandoned sessions

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::catalog::ArtifactCatalog;
use super::chunk_store::ChunkStore;
use super::token::validate_token;
use super::types::{
    Artifact, ChunkReceipt, ChunkWrite, SessionStatus, TransferError, UploadSession, CHUNK_SIZE,
    MAX_FILENAME_LEN, MAX_FILE_SIZE,
};
use crate::persistence::StateStore;

type SessionEntry = Arc<Mutex<UploadSession>>;

// ============================================================================
// Session Registry
// ============================================================================

/// Registry of in-progress upload sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    /// Active sessions indexed by file ID
    sessions: RwLock<HashMap<String, SessionEntry>>,

    chunk_store: ChunkStore,

    state_store: Arc<dyn StateStore>,

    chunk_size: usize,

    max_file_size: u64,
}

impl SessionRegistry {
    /// Create a registry with the default chunk size and file size limit
    pub fn new(chunk_store: ChunkStore, state_store: Arc<dyn StateStore>) -> Self {
        Self::with_limits(chunk_store, state_store, CHUNK_SIZE, MAX_FILE_SIZE)
    }

    /// Create a registry with custom chunk size and file size limit
    pub fn with_limits(
        chunk_store: ChunkStore,
        state_store: Arc<dyn StateStore>,
        chunk_size: usize,
        max_file_size: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: RwLock::new(HashMap::new()),
                chunk_store,
                state_store,
                chunk_size,
                max_file_size,
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    /// Replace in-memory sessions with previously persisted ones
    pub async fn restore(&self, sessions: HashMap<String, UploadSession>) {
        let restored = sessions
            .into_iter()
            .filter(|(_, session)| session.status != SessionStatus::Complete)
            .map(|(id, session)| (id, Arc::new(Mutex::new(session))))
            .collect();
        *self.inner.sessions.write().await = restored;
    }

    async fn entry(&self, file_id: &str) -> Result<SessionEntry, TransferError> {
        self.inner
            .sessions
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("file_id {}", file_id)))
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session
    pub async fn start(&self, filename: &str, file_size: u64) -> Result<UploadSession, TransferError> {
        let filename = validate_filename(filename)?;

        if file_size == 0 {
            return Err(TransferError::InvalidInput("file_size must be positive".to_string()));
        }
        if file_size > self.inner.max_file_size {
            return Err(TransferError::InvalidInput(format!(
                "file_size {} exceeds limit {}",
                file_size, self.inner.max_file_size
            )));
        }

        let session = UploadSession::new(filename, file_size, self.inner.chunk_size);

        self.inner.chunk_store.prepare_session(&session.file_id).await?;
        if let Err(e) = self.inner.state_store.put_session(&session).await {
            let _ = self.inner.chunk_store.delete_session_chunks(&session.file_id).await;
            return Err(e.into());
        }

        self.inner
            .sessions
            .write()
            .await
            .insert(session.file_id.clone(), Arc::new(Mutex::new(session.clone())));

        tracing::info!(
            file_id = %session.file_id,
            filename = %session.filename,
            file_size = session.file_size,
            chunks = session.chunk_count(),
            "Created upload session"
        );

        Ok(session)
    }

    /// Get a copy of a session by file ID
    pub async fn get_session(&self, file_id: &str) -> Result<UploadSession, TransferError> {
        let entry = self.entry(file_id).await?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Store one chunk. Re-sending a received chunk is a successful no-op.
    pub async fn write_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        token: &str,
        data: &[u8],
    ) -> Result<ChunkReceipt, TransferError> {
        let entry = self.entry(file_id).await?;
        let mut session = entry.lock().await;

        if session.status == SessionStatus::Complete {
            return Err(TransferError::NotFound(format!("file_id {}", file_id)));
        }
        if !validate_token(token, &session.upload_token) {
            return Err(TransferError::Forbidden("token mismatch".to_string()));
        }
        if chunk_id >= session.chunk_count() {
            return Err(TransferError::NotFound(format!(
                "chunk_id {} not in range 0..{}",
                chunk_id,
                session.chunk_count()
            )));
        }

        if session.chunks[chunk_id].received {
            tracing::debug!(
                file_id = %file_id,
                chunk_id = chunk_id,
                "Chunk already received"
            );
            return Ok(ChunkReceipt {
                outcome: ChunkWrite::AlreadyReceived,
                chunks_received: session.received_count(),
                total_chunks: session.chunk_count(),
            });
        }

        let expected_len = session.expected_chunk_len(chunk_id);
        if data.len() != expected_len {
            return Err(TransferError::InvalidInput(format!(
                "chunk {} must be {} bytes, got {}",
                chunk_id,
                expected_len,
                data.len()
            )));
        }

        let storage_ref = self
            .inner
            .chunk_store
            .store_chunk(file_id, chunk_id, data)
            .await?;

        // Persist first; the in-memory session only changes once durable
        let mut updated = session.clone();
        updated.mark_chunk_received(chunk_id, storage_ref);
        self.inner.state_store.put_session(&updated).await?;
        *session = updated;

        tracing::debug!(
            file_id = %file_id,
            chunk_id = chunk_id,
            chunks_received = session.received_count(),
            total_chunks = session.chunk_count(),
            progress = format!("{:.1}%", session.progress()),
            "Chunk uploaded"
        );

        Ok(ChunkReceipt {
            outcome: ChunkWrite::Accepted,
            chunks_received: session.received_count(),
            total_chunks: session.chunk_count(),
        })
    }

    /// Merge a complete session into an artifact and retire the session.
    ///
    /// Fails with `IncompleteUpload` while any chunk slot is empty; the
    /// session is left untouched so the client can fill the gaps.
    pub async fn finish(
        &self,
        file_id: &str,
        token: &str,
        catalog: &ArtifactCatalog,
    ) -> Result<Artifact, TransferError> {
        let entry = self.entry(file_id).await?;
        let mut session = entry.lock().await;

        if session.status == SessionStatus::Complete {
            return Err(TransferError::NotFound(format!("file_id {}", file_id)));
        }
        if !validate_token(token, &session.upload_token) {
            return Err(TransferError::Forbidden("token mismatch".to_string()));
        }
        if !session.is_complete() {
            return Err(TransferError::IncompleteUpload(session.missing_chunks()));
        }

        tracing::info!(
            file_id = %file_id,
            filename = %session.filename,
            chunks = session.chunk_count(),
            "Assembling file from chunks"
        );

        let artifact = catalog.ingest(&session, &self.inner.chunk_store).await?;

        session.status = SessionStatus::Complete;
        drop(session);
        self.retire(file_id).await;

        Ok(artifact)
    }

    /// Remove a session from memory, its record and its chunk files.
    /// Failures past this point are logged, not returned.
    pub async fn retire(&self, file_id: &str) {
        self.inner.sessions.write().await.remove(file_id);

        if let Err(e) = self.inner.state_store.delete_session(file_id).await {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to delete session record");
        }

        match self.inner.chunk_store.delete_session_chunks(file_id).await {
            Ok(count) => {
                tracing::debug!(file_id = %file_id, count = count, "Deleted session chunks");
            }
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to delete session chunks");
            }
        }
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Reclaim sessions with no successful write since `cutoff`
    ///
    /// Returns the number of sessions reclaimed
    pub async fn cleanup_abandoned(&self, cutoff: DateTime<Utc>) -> usize {
        let entries: Vec<(String, SessionEntry)> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let mut count = 0;
        for (file_id, entry) in entries {
            let mut session = entry.lock().await;
            if session.status == SessionStatus::Complete || session.updated_at >= cutoff {
                continue;
            }

            session.status = SessionStatus::Complete;
            drop(session);
            self.retire(&file_id).await;

            tracing::debug!(file_id = %file_id, "Reclaimed abandoned session");
            count += 1;
        }

        if count > 0 {
            tracing::info!(count = count, "Reclaimed abandoned upload sessions");
        }

        count
    }
}

/// Trim and check a client-supplied filename
fn validate_filename(filename: &str) -> Result<&str, TransferError> {
    let filename = filename.trim();

    if filename.is_empty() {
        return Err(TransferError::InvalidInput("filename is required".to_string()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(TransferError::InvalidInput(format!(
            "filename longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if filename.chars().any(char::is_control) {
        return Err(TransferError::InvalidInput(
            "filename contains control characters".to_string(),
        ));
    }

    Ok(filename)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStateStore;
    use tempfile::TempDir;

    struct Fixture {
        registry: SessionRegistry,
        catalog: ArtifactCatalog,
        store: Arc<MemoryStateStore>,
        temp_dir: TempDir,
    }

    fn fixture(chunk_size: usize) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let chunks = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let registry =
            SessionRegistry::with_limits(chunks, store.clone(), chunk_size, MAX_FILE_SIZE);
        let catalog = ArtifactCatalog::new(temp_dir.path().join("artifacts"), store.clone());
        Fixture {
            registry,
            catalog,
            store,
            temp_dir,
        }
    }

    #[tokio::test]
    async fn test_start_plans_chunks() {
        let f = fixture(CHUNK_SIZE);

        let session = f.registry.start("a.bin", 12_000_000).await.unwrap();
        assert_eq!(session.chunk_count(), 3);
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.chunks.iter().all(|slot| !slot.received));
        assert!(f.store.snapshot().sessions.contains_key(&session.file_id));
        assert!(f.temp_dir.path().join("chunks").join(&session.file_id).is_dir());

        let exact = f.registry.start("b.bin", CHUNK_SIZE as u64).await.unwrap();
        assert_eq!(exact.chunk_count(), 1);

        assert_ne!(session.file_id, exact.file_id);
        assert_ne!(session.upload_token, exact.upload_token);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_input() {
        let f = fixture(CHUNK_SIZE);

        assert!(matches!(
            f.registry.start("a.bin", 0).await,
            Err(TransferError::InvalidInput(_))
        ));
        assert!(matches!(
            f.registry.start("   ", 10).await,
            Err(TransferError::InvalidInput(_))
        ));
        assert!(matches!(
            f.registry.start("a\nb", 10).await,
            Err(TransferError::InvalidInput(_))
        ));
        assert!(matches!(
            f.registry.start("a.bin", MAX_FILE_SIZE + 1).await,
            Err(TransferError::InvalidInput(_))
        ));
        assert_eq!(f.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_chunk_is_idempotent() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 6).await.unwrap();
        let id = &session.file_id;

        let first = f
            .registry
            .write_chunk(id, 0, &session.upload_token, b"abcd")
            .await
            .unwrap();
        assert_eq!(first.outcome, ChunkWrite::Accepted);
        assert_eq!(first.chunks_received, 1);

        let replay = f
            .registry
            .write_chunk(id, 0, &session.upload_token, b"zzzz")
            .await
            .unwrap();
        assert_eq!(replay.outcome, ChunkWrite::AlreadyReceived);
        assert_eq!(replay.chunks_received, 1);

        let stored = std::fs::read(
            f.temp_dir
                .path()
                .join("chunks")
                .join(id)
                .join("00000000.chunk"),
        )
        .unwrap();
        assert_eq!(stored, b"abcd");
    }

    #[tokio::test]
    async fn test_write_chunk_rejections() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 6).await.unwrap();
        let id = &session.file_id;

        assert!(matches!(
            f.registry.write_chunk("missing", 0, &session.upload_token, b"a").await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            f.registry.write_chunk(id, 0, "wrong-token", b"a").await,
            Err(TransferError::Forbidden(_))
        ));
        assert!(matches!(
            f.registry.write_chunk(id, 2, &session.upload_token, b"a").await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            f.registry.write_chunk(id, 0, &session.upload_token, b"abcde").await,
            Err(TransferError::InvalidInput(_))
        ));
        assert!(matches!(
            f.registry.write_chunk(id, 0, &session.upload_token, b"").await,
            Err(TransferError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_lengths_must_match_declared_size() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 6).await.unwrap();
        let id = &session.file_id;
        let token = &session.upload_token;

        // Short non-final chunk
        assert!(matches!(
            f.registry.write_chunk(id, 0, token, b"abc").await,
            Err(TransferError::InvalidInput(_))
        ));
        // Final chunk longer than the remainder
        assert!(matches!(
            f.registry.write_chunk(id, 1, token, b"efg").await,
            Err(TransferError::InvalidInput(_))
        ));
        assert_eq!(f.registry.get_session(id).await.unwrap().received_count(), 0);

        f.registry.write_chunk(id, 0, token, b"abcd").await.unwrap();
        f.registry.write_chunk(id, 1, token, b"ef").await.unwrap();

        let artifact = f.registry.finish(id, token, &f.catalog).await.unwrap();
        assert_eq!(artifact.size_bytes, session.file_size);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_same_chunk_store_once() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 4).await.unwrap();

        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'a' + i; 4]).collect();
        let mut handles = Vec::new();
        for payload in payloads {
            let registry = f.registry.clone();
            let id = session.file_id.clone();
            let token = session.upload_token.clone();
            handles.push(tokio::spawn(async move {
                let receipt = registry.write_chunk(&id, 0, &token, &payload).await.unwrap();
                (receipt.outcome, payload)
            }));
        }

        let mut accepted = Vec::new();
        let mut replays = 0;
        for handle in handles {
            match handle.await.unwrap() {
                (ChunkWrite::Accepted, payload) => accepted.push(payload),
                (ChunkWrite::AlreadyReceived, _) => replays += 1,
            }
        }
        assert_eq!(accepted.len(), 1);
        assert_eq!(replays, 7);

        let stored = std::fs::read(
            f.temp_dir
                .path()
                .join("chunks")
                .join(&session.file_id)
                .join("00000000.chunk"),
        )
        .unwrap();
        assert_eq!(stored, accepted[0]);
        assert_eq!(f.registry.get_session(&session.file_id).await.unwrap().received_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_slot_open() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 4).await.unwrap();
        let id = &session.file_id;

        f.store.set_fail_writes(true);
        let result = f.registry.write_chunk(id, 0, &session.upload_token, b"abcd").await;
        assert!(matches!(result, Err(TransferError::Persistence(_))));
        assert_eq!(f.registry.get_session(id).await.unwrap().received_count(), 0);

        f.store.set_fail_writes(false);
        let retry = f
            .registry
            .write_chunk(id, 0, &session.upload_token, b"abcd")
            .await
            .unwrap();
        assert_eq!(retry.outcome, ChunkWrite::Accepted);
    }

    #[tokio::test]
    async fn test_finish_requires_all_chunks() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 10).await.unwrap();
        let id = &session.file_id;

        f.registry
            .write_chunk(id, 1, &session.upload_token, b"efgh")
            .await
            .unwrap();

        match f.registry.finish(id, &session.upload_token, &f.catalog).await {
            Err(TransferError::IncompleteUpload(missing)) => assert_eq!(missing, vec![0, 2]),
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }
        assert_eq!(f.registry.session_count().await, 1);
        assert!(f.catalog.is_empty().await);
    }

    #[tokio::test]
    async fn test_finish_merges_and_retires_session() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 10).await.unwrap();
        let id = &session.file_id;
        let token = &session.upload_token;

        assert!(matches!(
            f.registry.finish(id, "wrong-token", &f.catalog).await,
            Err(TransferError::Forbidden(_))
        ));

        f.registry.write_chunk(id, 2, token, b"ij").await.unwrap();
        f.registry.write_chunk(id, 0, token, b"abcd").await.unwrap();
        f.registry.write_chunk(id, 1, token, b"efgh").await.unwrap();

        let artifact = f.registry.finish(id, token, &f.catalog).await.unwrap();
        assert_eq!(artifact.size_bytes, 10);
        assert_eq!(std::fs::read(&artifact.storage_path).unwrap(), b"abcdefghij");

        assert_eq!(f.registry.session_count().await, 0);
        assert!(!f.store.snapshot().sessions.contains_key(id));
        assert!(!f.temp_dir.path().join("chunks").join(id).exists());

        assert!(matches!(
            f.registry.finish(id, token, &f.catalog).await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            f.registry.write_chunk(id, 0, token, b"abcd").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finish_merges_once() {
        let f = fixture(4);
        let session = f.registry.start("a.bin", 4).await.unwrap();
        f.registry
            .write_chunk(&session.file_id, 0, &session.upload_token, b"abcd")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = f.registry.clone();
            let catalog = f.catalog.clone();
            let id = session.file_id.clone();
            let token = session.upload_token.clone();
            handles.push(tokio::spawn(async move {
                registry.finish(&id, &token, &catalog).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(f.catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_abandoned() {
        let f = fixture(4);
        let stale = f.registry.start("old.bin", 8).await.unwrap();
        f.registry
            .write_chunk(&stale.file_id, 0, &stale.upload_token, b"abcd")
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        let fresh = f.registry.start("new.bin", 8).await.unwrap();

        assert_eq!(f.registry.cleanup_abandoned(cutoff).await, 1);
        assert_eq!(f.registry.session_count().await, 1);
        assert!(f.registry.get_session(&fresh.file_id).await.is_ok());
        assert!(!f.temp_dir.path().join("chunks").join(&stale.file_id).exists());
        assert!(!f.store.snapshot().sessions.contains_key(&stale.file_id));
    }

    #[tokio::test]
    async fn test_restore_skips_completed_sessions() {
        let f = fixture(4);
        let open = UploadSession::new("a", 4, 4);
        let mut done = UploadSession::new("b", 4, 4);
        done.status = SessionStatus::Complete;

        let mut sessions = HashMap::new();
        sessions.insert(open.file_id.clone(), open.clone());
        sessions.insert(done.file_id.clone(), done.clone());
        f.registry.restore(sessions).await;

        assert_eq!(f.registry.session_count().await, 1);
        assert!(f.registry.get_session(&open.file_id).await.is_ok());
    }
}
