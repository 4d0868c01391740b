//! Expiration Sweeper
//!
//! Evicts expired or used-up grants together with their artifacts, reclaims
//! artifacts no grant points at, and reclaims upload sessions that stopped
//! receiving chunks. Runs on demand and on a fixed interval.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::bucket::ShareCodeBucket;
use super::catalog::ArtifactCatalog;
use super::session::SessionRegistry;
use super::types::ORPHAN_ARTIFACT_GRACE_SECS;

/// Counters from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Grants removed from the bucket
    pub grants_evicted: u64,
    /// Backing files actually deleted
    pub artifacts_deleted: u64,
    /// Artifacts reclaimed because no grant referenced them
    pub orphans_reclaimed: u64,
    /// Abandoned upload sessions reclaimed
    pub sessions_reclaimed: u64,
    /// Deletions that failed and were skipped
    pub errors: u64,
}

/// Garbage collector for grants, artifacts and abandoned sessions
#[derive(Clone)]
pub struct ExpirationSweeper {
    bucket: ShareCodeBucket,
    catalog: ArtifactCatalog,
    sessions: SessionRegistry,
    session_ttl: chrono::Duration,
    orphan_grace: chrono::Duration,
}

impl ExpirationSweeper {
    pub fn new(
        bucket: ShareCodeBucket,
        catalog: ArtifactCatalog,
        sessions: SessionRegistry,
        session_ttl: chrono::Duration,
    ) -> Self {
        Self {
            bucket,
            catalog,
            sessions,
            session_ttl,
            orphan_grace: chrono::Duration::seconds(ORPHAN_ARTIFACT_GRACE_SECS),
        }
    }

    /// Override how long a grantless artifact survives after merging
    pub fn with_orphan_grace(mut self, grace: chrono::Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Run one sweep. Failures are logged and counted, never returned.
    pub async fn sweep(&self) -> SweepStats {
        let now = Utc::now();
        let mut stats = SweepStats::default();

        for candidate in self.bucket.evictable(now).await {
            // A concurrent sweep may have taken it already
            let Some(grant) = self.bucket.remove(&candidate.code).await else {
                continue;
            };
            stats.grants_evicted += 1;

            match self.catalog.reclaim(&grant.file_id).await {
                Ok(true) => stats.artifacts_deleted += 1,
                Ok(false) => {
                    tracing::debug!(
                        code = %grant.code,
                        file_id = %grant.file_id,
                        "Artifact already gone"
                    );
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        code = %grant.code,
                        file_id = %grant.file_id,
                        error = %e,
                        "Failed to reclaim artifact"
                    );
                }
            }
        }

        // Leftovers of failed reclaims and of crashes between merge and issue
        let referenced = self.bucket.referenced_file_ids().await;
        for orphan in self
            .catalog
            .unreferenced(&referenced, now - self.orphan_grace)
            .await
        {
            match self.catalog.reclaim(&orphan.file_id).await {
                Ok(deleted) => {
                    stats.orphans_reclaimed += 1;
                    if deleted {
                        stats.artifacts_deleted += 1;
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        file_id = %orphan.file_id,
                        error = %e,
                        "Failed to reclaim unreferenced artifact"
                    );
                }
            }
        }

        stats.sessions_reclaimed = self.sessions.cleanup_abandoned(now - self.session_ttl).await as u64;

        if stats != SweepStats::default() {
            tracing::info!(
                grants_evicted = stats.grants_evicted,
                artifacts_deleted = stats.artifacts_deleted,
                orphans_reclaimed = stats.orphans_reclaimed,
                sessions_reclaimed = stats.sessions_reclaimed,
                errors = stats.errors,
                "Sweep complete"
            );
        }

        stats
    }

    /// Start background sweep task. The first sweep runs immediately.
    pub fn start_sweep_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}
