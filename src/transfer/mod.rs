//! Chunked Transfer Module
//!
//! Implements the upload-then-share lifecycle:
//! - Chunked upload sessions with idempotent chunk writes
//! - Exactly-once merge of a complete session into an artifact
//! - Short numeric share codes with download and expiry limits
//! - Sweeping of used-up grants, their artifacts and abandoned sessions
//!
//! Protocol Flow:
//! 1. Client starts an upload and receives a file ID and upload token
//! 2. Client uploads every chunk, in any order
//! 3. Client finishes the upload and receives a share code
//! 4. Anyone holding the code can inspect and download the file until the
//!    grant expires or runs out of downloads

pub mod bucket;
pub mod catalog;
pub mod chunk_store;
pub mod service;
pub mod session;
pub mod sweeper;
pub mod token;
pub mod types;

pub use bucket::ShareCodeBucket;
pub use catalog::{ArtifactCatalog, OpenedArtifact};
pub use chunk_store::{ChunkStorage, ChunkStore, MergedFile};
pub use service::TransferService;
pub use session::SessionRegistry;
pub use sweeper::{ExpirationSweeper, SweepStats};
pub use types::*;
