//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::persistence::{JsonFileStore, PersistenceError, StateStore};
use crate::transfer::{TransferError, TransferService};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to open state store: {0}")]
    StateStore(#[from] PersistenceError),

    #[error("Failed to restore transfer state: {0}")]
    Restore(#[from] TransferError),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    transfers: TransferService,
}

impl AppState {
    /// Create the application state, restoring records from the data directory
    pub async fn new(config: Config) -> Result<Self, StateError> {
        let store = JsonFileStore::open(config.storage.state_dir()).await?;
        Self::with_store(config, Arc::new(store)).await
    }

    /// Create the application state on top of an explicit record store
    pub async fn with_store(
        config: Config,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, StateError> {
        let transfers = TransferService::open(&config, store).await?;

        Ok(Self {
            inner: Arc::new(AppStateInner { config, transfers }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the transfer service
    pub fn transfers(&self) -> &TransferService {
        &self.inner.transfers
    }
}
