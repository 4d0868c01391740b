//! In-memory state store

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{PersistedState, PersistenceError, StateStore};
use crate::transfer::{Artifact, ShareGrant, UploadSession};

/// State store that keeps records in process memory.
///
/// Writes can be switched to fail, which lets callers exercise their
/// rollback paths.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the current records
    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().clone()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<PersistedState, PersistenceError> {
        Ok(self.snapshot())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        self.check_writable()?;
        *self.state.lock() = state.clone();
        Ok(())
    }

    async fn put_session(&self, session: &UploadSession) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .sessions
            .insert(session.file_id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, file_id: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state.lock().sessions.remove(file_id);
        Ok(())
    }

    async fn put_artifact(&self, artifact: &Artifact) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .artifacts
            .insert(artifact.file_id.clone(), artifact.clone());
        Ok(())
    }

    async fn delete_artifact(&self, file_id: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state.lock().artifacts.remove(file_id);
        Ok(())
    }

    async fn put_grant(&self, grant: &ShareGrant) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .grants
            .insert(grant.code.clone(), grant.clone());
        Ok(())
    }

    async fn delete_grant(&self, code: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state.lock().grants.remove(code);
        Ok(())
    }
}
