//! Transfer types: upload sessions, artifacts and share grants

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::token;

// ============================================================================
// Constants
// ============================================================================

/// Fixed chunk size: 5MiB
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default maximum file size: 4GiB
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Abandoned sessions are reclaimed after this many hours without a write
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Downloads allowed per share code unless configured otherwise
pub const DEFAULT_MAX_DOWNLOADS: u32 = 1;

/// Share code lifetime: 1 hour
pub const DEFAULT_GRANT_TTL_SECS: i64 = 3600;

/// Artifacts without a grant are left alone for this long after merging
pub const ORPHAN_ARTIFACT_GRACE_SECS: i64 = 600;

/// Digits in a freshly issued share code
pub const SHARE_CODE_DIGITS: usize = 6;

/// Upper bound on share code length after collision fallback
pub const MAX_SHARE_CODE_DIGITS: usize = 10;

/// Attempts per code length before falling back to a longer code
pub const CODE_RETRY_LIMIT: usize = 32;

/// Number of chunks needed to carry `file_size` bytes.
pub fn chunk_count_for(file_size: u64, chunk_size: usize) -> usize {
    file_size.div_ceil(chunk_size as u64) as usize
}

// ============================================================================
// Session Types
// ============================================================================

/// Bookkeeping for one chunk slot of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSlot {
    pub received: bool,

    /// Backend reference of the stored chunk, set once received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No chunk received yet
    Pending,
    /// Some chunks received
    Uploading,
    /// All chunks received, waiting for finish
    Ready,
    /// Merged into an artifact (or reclaimed); no longer writable
    Complete,
}

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique file ID, shared with the resulting artifact
    pub file_id: String,

    /// Client-supplied name, display only
    pub filename: String,

    /// Declared total size in bytes
    pub file_size: u64,

    /// Chunk size used to plan this upload
    pub chunk_size: usize,

    /// One slot per chunk, indexed by chunk ID
    pub chunks: Vec<ChunkSlot>,

    /// Secret required for chunk writes and finish
    pub upload_token: String,

    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,

    /// Last successful mutation, used to detect abandoned sessions
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new session with fresh identifiers and an empty chunk plan
    pub fn new(filename: &str, file_size: u64, chunk_size: usize) -> Self {
        let now = Utc::now();
        let chunk_count = chunk_count_for(file_size, chunk_size);

        Self {
            file_id: token::generate_file_id(),
            filename: filename.to_string(),
            file_size,
            chunk_size,
            chunks: vec![ChunkSlot::default(); chunk_count],
            upload_token: token::generate_upload_token(),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn received_count(&self) -> usize {
        self.chunks.iter().filter(|slot| slot.received).count()
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|slot| slot.received)
    }

    /// Get indices of chunks that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.received)
            .map(|(i, _)| i)
            .collect()
    }

    /// Exact byte length of `chunk_id`: `chunk_size`, except for the
    /// remainder carried by the last chunk
    pub fn expected_chunk_len(&self, chunk_id: usize) -> usize {
        let offset = chunk_id as u64 * self.chunk_size as u64;
        self.file_size
            .saturating_sub(offset)
            .min(self.chunk_size as u64) as usize
    }

    /// Mark a chunk as received and advance the status
    pub fn mark_chunk_received(&mut self, chunk_id: usize, storage_ref: String) {
        if let Some(slot) = self.chunks.get_mut(chunk_id) {
            slot.received = true;
            slot.storage_ref = Some(storage_ref);
        }

        self.status = if self.is_complete() {
            SessionStatus::Ready
        } else {
            SessionStatus::Uploading
        };
        self.updated_at = Utc::now();
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 100.0;
        }
        (self.received_count() as f64 / self.chunks.len() as f64) * 100.0
    }
}

/// Outcome of a chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Accepted,
    /// The slot was already filled; nothing was rewritten
    AlreadyReceived,
}

/// Result of a chunk write with the session's progress after it
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub outcome: ChunkWrite,
    pub chunks_received: usize,
    pub total_chunks: usize,
}

// ============================================================================
// Artifact Types
// ============================================================================

/// A completed, merged file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_id: String,
    pub filename: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,

    /// Hex SHA-256 of the merged bytes
    pub sha256: String,

    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Share Grant Types
// ============================================================================

/// Limits applied to newly issued grants
#[derive(Debug, Clone, Copy)]
pub struct GrantPolicy {
    pub max_downloads: u32,
    pub ttl: Duration,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            ttl: Duration::seconds(DEFAULT_GRANT_TTL_SECS),
        }
    }
}

/// Download permission bound to a share code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub code: String,

    /// Artifact this grant points at (not owned)
    pub file_id: String,

    pub download_count: u32,
    pub available_download_count: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ShareGrant {
    pub fn new(code: String, file_id: String, policy: &GrantPolicy, now: DateTime<Utc>) -> Self {
        Self {
            code,
            file_id,
            download_count: 0,
            available_download_count: policy.max_downloads,
            issued_at: now,
            expires_at: now + policy.ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.download_count >= self.available_download_count
    }

    /// A grant can serve a download iff it is neither expired nor exhausted
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    /// Whether the sweeper may evict this grant and its artifact
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now || self.is_exhausted()
    }

    pub fn remaining_downloads(&self) -> u32 {
        self.available_download_count.saturating_sub(self.download_count)
    }
}

/// Public view of a grant and its artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantView {
    pub code: String,
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub remaining_downloads: u32,
    pub expires_at: DateTime<Utc>,
    pub sha256: String,
}

impl GrantView {
    pub fn new(grant: &ShareGrant, artifact: &Artifact) -> Self {
        Self {
            code: grant.code.clone(),
            file_name: artifact.filename.clone(),
            size: artifact.size_bytes,
            created_at: artifact.created_at,
            remaining_downloads: grant.remaining_downloads(),
            expires_at: grant.expires_at,
            sha256: artifact.sha256.clone(),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Response to start-upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub file_id: String,
    pub token: String,
    pub chunk_count: usize,
    pub chunk_size: usize,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub chunk_id: usize,

    /// Always true on success, replays included
    pub accepted: bool,

    /// True when the chunk had been stored by an earlier request
    pub already_received: bool,

    pub chunks_received: usize,
    pub total_chunks: usize,
    pub complete: bool,
}

/// Response after finishing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishResponse {
    pub code: String,
    pub file_id: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Transfer error types
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Download or expiry limits reached; rendered exactly like `NotFound`
    #[error("Exhausted: {0}")]
    Exhausted(String),

    #[error("Upload incomplete, missing chunks: {0:?}")]
    IncompleteUpload(Vec<usize>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl TransferError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound(_) | Self::Exhausted(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::IncompleteUpload(_) => StatusCode::CONFLICT,
            Self::Storage(_) | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
