//! Transfer Service
//!
//! Wires sessions, artifacts, grants and the sweeper together and exposes
//! the operations the HTTP layer calls.

use std::sync::Arc;

use crate::config::Config;
use crate::persistence::{PersistedState, StateStore};

use super::bucket::ShareCodeBucket;
use super::catalog::{ArtifactCatalog, OpenedArtifact};
use super::chunk_store::ChunkStore;
use super::session::SessionRegistry;
use super::sweeper::{ExpirationSweeper, SweepStats};
use super::token::validate_token;
use super::types::{
    ChunkUploadResponse, ChunkWrite, FinishResponse, GrantView, StartUploadResponse,
    TransferError,
};

#[derive(Clone)]
pub struct TransferService {
    sessions: SessionRegistry,
    catalog: ArtifactCatalog,
    bucket: ShareCodeBucket,
    sweeper: ExpirationSweeper,
    access_token: Option<Arc<str>>,
}

impl TransferService {
    /// Build the service and restore whatever `state_store` holds
    pub async fn open(
        config: &Config,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self, TransferError> {
        let chunk_store = ChunkStore::with_local_storage(config.storage.chunk_dir());
        let sessions = SessionRegistry::with_limits(
            chunk_store,
            state_store.clone(),
            config.transfer.chunk_size,
            config.transfer.max_file_size,
        );
        let catalog = ArtifactCatalog::new(config.storage.artifact_dir(), state_store.clone());
        let bucket = ShareCodeBucket::new(state_store.clone(), config.share.grant_policy());
        let sweeper = ExpirationSweeper::new(
            bucket.clone(),
            catalog.clone(),
            sessions.clone(),
            config.sweep.session_ttl(),
        );

        let PersistedState {
            sessions: mut pending,
            artifacts,
            grants,
        } = state_store.load().await?;

        // A session whose artifact exists was merged before its record went away
        let merged: Vec<String> = pending
            .keys()
            .filter(|file_id| artifacts.contains_key(*file_id))
            .cloned()
            .collect();
        for file_id in &merged {
            pending.remove(file_id);
        }

        tracing::info!(
            sessions = pending.len(),
            artifacts = artifacts.len(),
            grants = grants.len(),
            "Restored transfer state"
        );

        catalog.restore(artifacts).await;
        bucket.restore(grants).await;
        sessions.restore(pending).await;

        for file_id in &merged {
            tracing::info!(file_id = %file_id, "Retiring session merged before restart");
            sessions.retire(file_id).await;
        }

        Ok(Self {
            sessions,
            catalog,
            bucket,
            sweeper,
            access_token: config.auth.access_token.as_deref().map(Arc::from),
        })
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    pub fn bucket(&self) -> &ShareCodeBucket {
        &self.bucket
    }

    pub fn sweeper(&self) -> &ExpirationSweeper {
        &self.sweeper
    }

    /// Check the upload credential. Without a configured token every caller passes.
    pub fn authorize(&self, credential: Option<&str>) -> Result<(), TransferError> {
        let Some(expected) = self.access_token.as_deref() else {
            return Ok(());
        };

        match credential {
            Some(given) if validate_token(given, expected) => Ok(()),
            Some(_) => Err(TransferError::Forbidden("invalid access token".to_string())),
            None => Err(TransferError::Forbidden("access token required".to_string())),
        }
    }

    pub async fn start_upload(
        &self,
        filename: &str,
        file_size: u64,
    ) -> Result<StartUploadResponse, TransferError> {
        let session = self.sessions.start(filename, file_size).await?;

        Ok(StartUploadResponse {
            chunk_count: session.chunk_count(),
            chunk_size: session.chunk_size,
            file_id: session.file_id,
            token: session.upload_token,
        })
    }

    pub async fn upload_chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        token: &str,
        data: &[u8],
    ) -> Result<ChunkUploadResponse, TransferError> {
        let receipt = self
            .sessions
            .write_chunk(file_id, chunk_id, token, data)
            .await?;

        Ok(ChunkUploadResponse {
            chunk_id,
            accepted: true,
            already_received: receipt.outcome == ChunkWrite::AlreadyReceived,
            chunks_received: receipt.chunks_received,
            total_chunks: receipt.total_chunks,
            complete: receipt.chunks_received == receipt.total_chunks,
        })
    }

    /// Merge the upload and hand out its share code
    pub async fn finish_upload(
        &self,
        file_id: &str,
        token: &str,
    ) -> Result<FinishResponse, TransferError> {
        let artifact = self.sessions.finish(file_id, token, &self.catalog).await?;

        let grant = match self.bucket.issue(&artifact.file_id).await {
            Ok(grant) => grant,
            Err(e) => {
                // Nothing could ever reach an artifact without a grant
                if let Err(reclaim_err) = self.catalog.reclaim(&artifact.file_id).await {
                    tracing::warn!(
                        file_id = %artifact.file_id,
                        error = %reclaim_err,
                        "Failed to reclaim ungranted artifact"
                    );
                }
                return Err(e);
            }
        };

        Ok(FinishResponse {
            code: grant.code,
            file_id: artifact.file_id,
            size: artifact.size_bytes,
            expires_at: grant.expires_at,
        })
    }

    /// Describe a shared file without spending a download
    pub async fn info(&self, code: &str) -> Result<GrantView, TransferError> {
        let result = self.bucket.lookup(code, &self.catalog).await;
        self.sweep_if_exhausted(&result).await;
        result
    }

    /// Spend one download and open the shared file
    pub async fn download(&self, code: &str) -> Result<OpenedArtifact, TransferError> {
        let result = self.bucket.consume(code, &self.catalog).await;
        self.sweep_if_exhausted(&result).await;
        result
    }

    pub async fn sweep(&self) -> SweepStats {
        self.sweeper.sweep().await
    }

    async fn sweep_if_exhausted<T>(&self, result: &Result<T, TransferError>) {
        if let Err(TransferError::Exhausted(code)) = result {
            tracing::debug!(code = %code, "Exhausted grant requested, sweeping");
            self.sweeper.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{JsonFileStore, MemoryStateStore, PersistenceError};
    use crate::transfer::{Artifact, ShareGrant, UploadSession};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();
        config.transfer.chunk_size = 4;
        config
    }

    async fn read_all(opened: OpenedArtifact) -> Vec<u8> {
        let mut file = opened.file;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn upload(service: &TransferService, name: &str, data: &[u8]) -> FinishResponse {
        let started = service.start_upload(name, data.len() as u64).await.unwrap();
        for (chunk_id, chunk) in data.chunks(started.chunk_size).enumerate() {
            service
                .upload_chunk(&started.file_id, chunk_id, &started.token, chunk)
                .await
                .unwrap();
        }
        service
            .finish_upload(&started.file_id, &started.token)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_share_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let service = TransferService::open(&test_config(&temp_dir), Arc::new(MemoryStateStore::new()))
            .await
            .unwrap();

        let finished = upload(&service, "notes.txt", b"hello world").await;
        assert_eq!(finished.code.len(), 6);
        assert_eq!(finished.size, 11);

        let view = service.info(&finished.code).await.unwrap();
        assert_eq!(view.file_name, "notes.txt");
        assert_eq!(view.remaining_downloads, 1);

        let opened = service.download(&finished.code).await.unwrap();
        assert_eq!(read_all(opened).await, b"hello world");

        let err = service.download(&finished.code).await.unwrap_err();
        assert!(matches!(err, TransferError::Exhausted(_)));

        // The failed attempt swept the grant and its file
        assert!(service.bucket().is_empty().await);
        assert!(service.catalog().is_empty().await);
        let err = service.info(&finished.code).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_chunk_reports_replays() {
        let temp_dir = TempDir::new().unwrap();
        let service = TransferService::open(&test_config(&temp_dir), Arc::new(MemoryStateStore::new()))
            .await
            .unwrap();

        let started = service.start_upload("a.bin", 6).await.unwrap();
        assert_eq!(started.chunk_count, 2);

        let first = service
            .upload_chunk(&started.file_id, 1, &started.token, b"ef")
            .await
            .unwrap();
        assert!(first.accepted && !first.already_received && !first.complete);

        let replay = service
            .upload_chunk(&started.file_id, 1, &started.token, b"ef")
            .await
            .unwrap();
        assert!(replay.accepted && replay.already_received);
        assert_eq!(replay.chunks_received, 1);

        let last = service
            .upload_chunk(&started.file_id, 0, &started.token, b"abcd")
            .await
            .unwrap();
        assert!(last.complete);
    }

    #[tokio::test]
    async fn test_authorize() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);

        let open = TransferService::open(&config, Arc::new(MemoryStateStore::new()))
            .await
            .unwrap();
        assert!(open.authorize(None).is_ok());

        config.auth.access_token = Some("s3cret".to_string());
        let guarded = TransferService::open(&config, Arc::new(MemoryStateStore::new()))
            .await
            .unwrap();
        assert!(guarded.authorize(Some("s3cret")).is_ok());
        assert!(matches!(
            guarded.authorize(Some("guess")),
            Err(TransferError::Forbidden(_))
        ));
        assert!(matches!(guarded.authorize(None), Err(TransferError::Forbidden(_))));
    }

    /// Accepts everything except grant records
    struct GrantlessStore(MemoryStateStore);

    #[async_trait::async_trait]
    impl StateStore for GrantlessStore {
        async fn load(&self) -> Result<PersistedState, PersistenceError> {
            self.0.load().await
        }
        async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
            self.0.save(state).await
        }
        async fn put_session(&self, session: &UploadSession) -> Result<(), PersistenceError> {
            self.0.put_session(session).await
        }
        async fn delete_session(&self, file_id: &str) -> Result<(), PersistenceError> {
            self.0.delete_session(file_id).await
        }
        async fn put_artifact(&self, artifact: &Artifact) -> Result<(), PersistenceError> {
            self.0.put_artifact(artifact).await
        }
        async fn delete_artifact(&self, file_id: &str) -> Result<(), PersistenceError> {
            self.0.delete_artifact(file_id).await
        }
        async fn put_grant(&self, _grant: &ShareGrant) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("grants disabled".to_string()))
        }
        async fn delete_grant(&self, code: &str) -> Result<(), PersistenceError> {
            self.0.delete_grant(code).await
        }
    }

    #[tokio::test]
    async fn test_finish_reclaims_artifact_when_grant_cannot_be_issued() {
        let temp_dir = TempDir::new().unwrap();
        let service = TransferService::open(
            &test_config(&temp_dir),
            Arc::new(GrantlessStore(MemoryStateStore::new())),
        )
        .await
        .unwrap();

        let started = service.start_upload("a.bin", 3).await.unwrap();
        service
            .upload_chunk(&started.file_id, 0, &started.token, b"abc")
            .await
            .unwrap();

        let err = service
            .finish_upload(&started.file_id, &started.token)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Persistence(_)));

        let artifact_path = service.catalog().artifact_path(&started.file_id).unwrap();
        assert!(!artifact_path.exists());
        assert!(service.catalog().is_empty().await);
        assert!(service.bucket().is_empty().await);
    }

    #[tokio::test]
    async fn test_open_retires_sessions_that_were_already_merged() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let session = UploadSession::new("done.bin", 4, 4);
        let chunk_dir = config.storage.chunk_dir().join("chunks").join(&session.file_id);
        std::fs::create_dir_all(&chunk_dir).unwrap();
        std::fs::write(chunk_dir.join("00000000.chunk"), b"abcd").unwrap();

        let artifact = Artifact {
            file_id: session.file_id.clone(),
            filename: session.filename.clone(),
            storage_path: config.storage.artifact_dir().join(format!("{}.bin", session.file_id)),
            size_bytes: 4,
            sha256: String::new(),
            created_at: chrono::Utc::now(),
        };

        let mut state = PersistedState::default();
        state.sessions.insert(session.file_id.clone(), session.clone());
        state.artifacts.insert(artifact.file_id.clone(), artifact);
        let store = Arc::new(MemoryStateStore::with_state(state));

        let service = TransferService::open(&config, store.clone()).await.unwrap();

        assert_eq!(service.sessions().session_count().await, 0);
        assert!(!store.snapshot().sessions.contains_key(&session.file_id));
        assert!(!chunk_dir.exists());
        assert!(service.catalog().contains(&session.file_id).await);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_restored_artifact_without_grant() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let file_id = crate::transfer::token::generate_file_id();
        let storage_path = config.storage.artifact_dir().join(format!("{}.bin", file_id));
        std::fs::create_dir_all(config.storage.artifact_dir()).unwrap();
        std::fs::write(&storage_path, b"ungranted").unwrap();

        let mut state = PersistedState::default();
        state.artifacts.insert(
            file_id.clone(),
            Artifact {
                file_id: file_id.clone(),
                filename: "ungranted.bin".to_string(),
                storage_path: storage_path.clone(),
                size_bytes: 9,
                sha256: String::new(),
                created_at: chrono::Utc::now() - chrono::Duration::hours(2),
            },
        );
        let store = Arc::new(MemoryStateStore::with_state(state));
        let service = TransferService::open(&config, store.clone()).await.unwrap();

        let stats = service.sweep().await;
        assert_eq!(stats.orphans_reclaimed, 1);
        assert_eq!(stats.artifacts_deleted, 1);
        assert!(!storage_path.exists());
        assert!(service.catalog().is_empty().await);
        assert!(store.snapshot().artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let state_dir = config.storage.state_dir();

        let (started, code) = {
            let store = Arc::new(JsonFileStore::open(&state_dir).await.unwrap());
            let service = TransferService::open(&config, store).await.unwrap();

            let shared = upload(&service, "kept.txt", b"persisted").await;
            let started = service.start_upload("half.bin", 8).await.unwrap();
            service
                .upload_chunk(&started.file_id, 0, &started.token, b"1234")
                .await
                .unwrap();
            (started, shared.code)
        };

        let store = Arc::new(JsonFileStore::open(&state_dir).await.unwrap());
        let service = TransferService::open(&config, store).await.unwrap();

        let view = service.info(&code).await.unwrap();
        assert_eq!(view.file_name, "kept.txt");

        let replay = service
            .upload_chunk(&started.file_id, 0, &started.token, b"1234")
            .await
            .unwrap();
        assert!(replay.already_received);
        service
            .upload_chunk(&started.file_id, 1, &started.token, b"5678")
            .await
            .unwrap();
        let finished = service
            .finish_upload(&started.file_id, &started.token)
            .await
            .unwrap();

        let opened = service.download(&finished.code).await.unwrap();
        assert_eq!(read_all(opened).await, b"12345678");
    }
}
