//! Durable state for sessions, artifacts and share grants
//!
//! Each record set is keyed independently. Mutations are written through
//! one record at a time; `load` returns all three maps at startup.

mod file_store;
mod memory;

pub use file_store::JsonFileStore;
pub use memory::MemoryStateStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transfer::{Artifact, ShareGrant, TransferError, UploadSession};

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid record key: {0:?}")]
    InvalidKey(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<PersistenceError> for TransferError {
    fn from(e: PersistenceError) -> Self {
        TransferError::Persistence(e.to_string())
    }
}

/// Complete persisted state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Sessions by file ID
    pub sessions: HashMap<String, UploadSession>,

    /// Artifacts by file ID
    pub artifacts: HashMap<String, Artifact>,

    /// Grants by share code
    pub grants: HashMap<String, ShareGrant>,
}

/// Load/save interface for the three record sets
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Load every record
    async fn load(&self) -> Result<PersistedState, PersistenceError>;

    /// Replace all stored records with `state`
    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;

    async fn put_session(&self, session: &UploadSession) -> Result<(), PersistenceError>;

    async fn delete_session(&self, file_id: &str) -> Result<(), PersistenceError>;

    async fn put_artifact(&self, artifact: &Artifact) -> Result<(), PersistenceError>;

    async fn delete_artifact(&self, file_id: &str) -> Result<(), PersistenceError>;

    async fn put_grant(&self, grant: &ShareGrant) -> Result<(), PersistenceError>;

    async fn delete_grant(&self, code: &str) -> Result<(), PersistenceError>;
}
