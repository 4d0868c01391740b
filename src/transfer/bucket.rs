//! Share Code Bucket
//!
//! Maps short numeric codes to download grants. Each grant sits behind its
//! own lock so that the usability check, the counter increment and its
//! persistence form one exclusive step per code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::catalog::{ArtifactCatalog, OpenedArtifact};
use super::token::generate_share_code;
use super::types::{
    GrantPolicy, GrantView, ShareGrant, TransferError, CODE_RETRY_LIMIT, MAX_SHARE_CODE_DIGITS,
    SHARE_CODE_DIGITS,
};
use crate::persistence::StateStore;

type GrantEntry = Arc<Mutex<ShareGrant>>;

/// Active download grants keyed by share code
#[derive(Clone)]
pub struct ShareCodeBucket {
    inner: Arc<ShareCodeBucketInner>,
}

struct ShareCodeBucketInner {
    grants: RwLock<HashMap<String, GrantEntry>>,
    state_store: Arc<dyn StateStore>,
    policy: GrantPolicy,
}

impl ShareCodeBucket {
    pub fn new(state_store: Arc<dyn StateStore>, policy: GrantPolicy) -> Self {
        Self {
            inner: Arc::new(ShareCodeBucketInner {
                grants: RwLock::new(HashMap::new()),
                state_store,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> &GrantPolicy {
        &self.inner.policy
    }

    /// Replace in-memory grants with previously persisted ones
    pub async fn restore(&self, grants: HashMap<String, ShareGrant>) {
        let restored = grants
            .into_iter()
            .map(|(code, grant)| (code, Arc::new(Mutex::new(grant))))
            .collect();
        *self.inner.grants.write().await = restored;
    }

    async fn entry(&self, code: &str) -> Result<GrantEntry, TransferError> {
        self.inner
            .grants
            .read()
            .await
            .get(code)
            .cloned()
            .ok_or_else(|| TransferError::NotFound("code not found".to_string()))
    }

    /// Issue a grant for an artifact under a fresh, unused code
    pub async fn issue(&self, file_id: &str) -> Result<ShareGrant, TransferError> {
        let mut grants = self.inner.grants.write().await;

        let code = allocate_code(|code| grants.contains_key(code), generate_share_code)?;
        let grant = ShareGrant::new(
            code.clone(),
            file_id.to_string(),
            &self.inner.policy,
            Utc::now(),
        );

        self.inner.state_store.put_grant(&grant).await?;
        grants.insert(code, Arc::new(Mutex::new(grant.clone())));

        tracing::info!(
            code = %grant.code,
            file_id = %file_id,
            downloads = grant.available_download_count,
            expires_at = %grant.expires_at,
            "Issued share code"
        );

        Ok(grant)
    }

    /// Describe a grant and its artifact.
    ///
    /// Unknown codes and reclaimed artifacts are `NotFound`; expired or
    /// used-up grants are `Exhausted`.
    pub async fn lookup(
        &self,
        code: &str,
        catalog: &ArtifactCatalog,
    ) -> Result<GrantView, TransferError> {
        let grant = self.entry(code).await?.lock().await.clone();

        let artifact = catalog
            .get(&grant.file_id)
            .await
            .ok_or_else(|| TransferError::NotFound("code not found".to_string()))?;

        if !grant.is_usable(Utc::now()) {
            return Err(TransferError::Exhausted(code.to_string()));
        }

        Ok(GrantView::new(&grant, &artifact))
    }

    /// Spend one download.
    ///
    /// The artifact is opened before the counter moves, so the returned
    /// handle stays readable even if the grant is swept right after.
    pub async fn consume(
        &self,
        code: &str,
        catalog: &ArtifactCatalog,
    ) -> Result<OpenedArtifact, TransferError> {
        let entry = self.entry(code).await?;
        let mut grant = entry.lock().await;

        if !grant.is_usable(Utc::now()) {
            return Err(TransferError::Exhausted(code.to_string()));
        }

        let opened = catalog.open(&grant.file_id).await?;

        let mut updated = grant.clone();
        updated.download_count += 1;
        self.inner.state_store.put_grant(&updated).await?;
        *grant = updated;

        tracing::info!(
            code = %code,
            file_id = %grant.file_id,
            remaining = grant.remaining_downloads(),
            "Download granted"
        );

        Ok(opened)
    }

    pub async fn get(&self, code: &str) -> Option<ShareGrant> {
        let entry = self.entry(code).await.ok()?;
        let grant = entry.lock().await;
        Some(grant.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.grants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Grants that are expired or used up as of `now`
    pub async fn evictable(&self, now: DateTime<Utc>) -> Vec<ShareGrant> {
        let entries: Vec<GrantEntry> = self.inner.grants.read().await.values().cloned().collect();

        let mut evictable = Vec::new();
        for entry in entries {
            let grant = entry.lock().await;
            if grant.is_evictable(now) {
                evictable.push(grant.clone());
            }
        }
        evictable
    }

    /// File IDs that at least one grant still points at
    pub async fn referenced_file_ids(&self) -> HashSet<String> {
        let entries: Vec<GrantEntry> = self.inner.grants.read().await.values().cloned().collect();

        let mut file_ids = HashSet::with_capacity(entries.len());
        for entry in entries {
            file_ids.insert(entry.lock().await.file_id.clone());
        }
        file_ids
    }

    /// Drop a grant and its record. Returns `None` if it was already gone.
    pub async fn remove(&self, code: &str) -> Option<ShareGrant> {
        let entry = self.inner.grants.write().await.remove(code)?;

        if let Err(e) = self.inner.state_store.delete_grant(code).await {
            tracing::warn!(code = %code, error = %e, "Failed to delete grant record");
        }

        let grant = entry.lock().await;
        Some(grant.clone())
    }
}

/// Pick a code not yet taken.
///
/// Tries `CODE_RETRY_LIMIT` random codes per length, starting at
/// `SHARE_CODE_DIGITS` and growing one digit at a time.
fn allocate_code(
    is_taken: impl Fn(&str) -> bool,
    mut generate: impl FnMut(usize) -> String,
) -> Result<String, TransferError> {
    for digits in SHARE_CODE_DIGITS..=MAX_SHARE_CODE_DIGITS {
        for _ in 0..CODE_RETRY_LIMIT {
            let code = generate(digits);
            if !is_taken(&code) {
                return Ok(code);
            }
        }
        tracing::warn!(digits = digits, "Share code space congested, lengthening code");
    }

    Err(TransferError::Storage("share code space exhausted".to_string()))
}
