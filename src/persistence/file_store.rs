//! JSON-per-record filesystem store
//!
//! Layout under the root directory:
//!
//! ```text
//! sessions/<file_id>.json
//! artifacts/<file_id>.json
//! grants/<code>.json
//! ```
//!
//! Every write goes to a temporary file that is synced and renamed over
//! the record, so a crash leaves either the old or the new record.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{PersistedState, PersistenceError, StateStore};
use crate::transfer::token::is_safe_key;
use crate::transfer::{Artifact, ShareGrant, UploadSession};

const SESSIONS: &str = "sessions";
const ARTIFACTS: &str = "artifacts";
const GRANTS: &str = "grants";
const RECORD_EXT: &str = "json";

/// Filesystem-backed state store
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        for kind in [SESSIONS, ARTIFACTS, GRANTS] {
            tokio::fs::create_dir_all(root.join(kind)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, key: &str) -> Result<PathBuf, PersistenceError> {
        if !is_safe_key(key) {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(kind).join(format!("{}.{}", key, RECORD_EXT)))
    }

    async fn write_record<T: Serialize>(
        &self,
        kind: &str,
        key: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let path = self.record_path(kind, key)?;
        let body = serde_json::to_vec_pretty(value)?;

        let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_record(&self, kind: &str, key: &str) -> Result<(), PersistenceError> {
        let path = self.record_path(kind, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of all records of one kind
    async fn record_keys(&self, kind: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(kind)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                if is_safe_key(key) {
                    keys.push(key.to_string());
                }
            }
        }

        Ok(keys)
    }

    async fn read_records<T: DeserializeOwned>(
        &self,
        kind: &str,
    ) -> Result<HashMap<String, T>, PersistenceError> {
        let mut records = HashMap::new();

        for key in self.record_keys(kind).await? {
            let path = self.record_path(kind, &key)?;
            let body = match tokio::fs::read(&path).await {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<T>(&body) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(e) => {
                    tracing::warn!(
                        kind = kind,
                        key = %key,
                        error = %e,
                        "Skipping unreadable record"
                    );
                }
            }
        }

        Ok(records)
    }

    async fn replace_kind<T: Serialize>(
        &self,
        kind: &str,
        records: &HashMap<String, T>,
    ) -> Result<(), PersistenceError> {
        for (key, record) in records {
            self.write_record(kind, key, record).await?;
        }

        let keep: HashSet<&str> = records.keys().map(String::as_str).collect();
        for key in self.record_keys(kind).await? {
            if !keep.contains(key.as_str()) {
                self.remove_record(kind, &key).await?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedState, PersistenceError> {
        let state = PersistedState {
            sessions: self.read_records(SESSIONS).await?,
            artifacts: self.read_records(ARTIFACTS).await?,
            grants: self.read_records(GRANTS).await?,
        };

        tracing::debug!(
            root = %self.root.display(),
            sessions = state.sessions.len(),
            artifacts = state.artifacts.len(),
            grants = state.grants.len(),
            "Loaded persisted state"
        );

        Ok(state)
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        self.replace_kind(SESSIONS, &state.sessions).await?;
        self.replace_kind(ARTIFACTS, &state.artifacts).await?;
        self.replace_kind(GRANTS, &state.grants).await
    }

    async fn put_session(&self, session: &UploadSession) -> Result<(), PersistenceError> {
        self.write_record(SESSIONS, &session.file_id, session).await
    }

    async fn delete_session(&self, file_id: &str) -> Result<(), PersistenceError> {
        self.remove_record(SESSIONS, file_id).await
    }

    async fn put_artifact(&self, artifact: &Artifact) -> Result<(), PersistenceError> {
        self.write_record(ARTIFACTS, &artifact.file_id, artifact).await
    }

    async fn delete_artifact(&self, file_id: &str) -> Result<(), PersistenceError> {
        self.remove_record(ARTIFACTS, file_id).await
    }

    async fn put_grant(&self, grant: &ShareGrant) -> Result<(), PersistenceError> {
        self.write_record(GRANTS, &grant.code, grant).await
    }

    async fn delete_grant(&self, code: &str) -> Result<(), PersistenceError> {
        self.remove_record(GRANTS, code).await
    }
}
