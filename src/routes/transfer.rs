//! Transfer Routes
//!
//! HTTP endpoints for chunked uploads and share-code downloads.
//!
//! Endpoints:
//! - POST /upload/start - Open an upload session
//! - POST /upload/chunk - Upload one chunk as the raw request body
//! - POST /upload/finish - Merge the chunks and issue a share code
//! - GET /info/:code - Describe a shared file
//! - GET /download/:code - Spend one download and stream the file

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::state::AppState;
use crate::transfer::{
    ChunkUploadResponse, FinishResponse, GrantView, OpenedArtifact, StartUploadResponse,
    TransferError, CHUNK_SIZE,
};

/// Headroom over the chunk size for the chunk route body limit
const CHUNK_BODY_SLACK: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(rename = "missingChunks", skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<usize>>,
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = match &self {
            TransferError::NotFound(_) | TransferError::Exhausted(_) => "NOT_FOUND",
            TransferError::Forbidden(_) => "FORBIDDEN",
            TransferError::InvalidInput(_) => "INVALID_INPUT",
            TransferError::IncompleteUpload(_) => "INCOMPLETE_UPLOAD",
            TransferError::Storage(_) => "STORAGE_ERROR",
            TransferError::Persistence(_) => "PERSISTENCE_ERROR",
        };

        let (error, missing_chunks) = match self {
            // Indistinguishable from an unknown code
            TransferError::Exhausted(_) => {
                (TransferError::NotFound("code not found".to_string()).to_string(), None)
            }
            TransferError::IncompleteUpload(missing) => {
                let message = format!("Upload incomplete, {} chunks missing", missing.len());
                (message, Some(missing))
            }
            err @ (TransferError::Storage(_) | TransferError::Persistence(_)) => {
                tracing::error!(error = %err, "Transfer failed");
                (err.to_string(), None)
            }
            err => (err.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error,
            code,
            missing_chunks,
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the transfer router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload/start", post(start_upload))
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(CHUNK_SIZE + CHUNK_BODY_SLACK)),
        )
        .route("/upload/finish", post(finish_upload))
        .route("/info/:code", get(info))
        .route("/download/:code", get(download))
}

// ============================================================================
// Query Parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub filename: Option<String>,
    pub file_size: Option<String>,
    pub utoken: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub file_id: Option<String>,
    pub chunk_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FinishQuery {
    pub file_id: Option<String>,
    pub token: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, TransferError> {
    value
        .as_deref()
        .ok_or_else(|| TransferError::InvalidInput(format!("missing parameter {}", name)))
}

fn required_token(value: &Option<String>) -> Result<&str, TransferError> {
    value
        .as_deref()
        .ok_or_else(|| TransferError::Forbidden("upload token required".to_string()))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, TransferError> {
    value
        .trim()
        .parse()
        .map_err(|_| TransferError::InvalidInput(format!("{} must be a non-negative integer", name)))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/start?filename=...&file_size=...&utoken=...
async fn start_upload(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> Result<Json<StartUploadResponse>, TransferError> {
    state.transfers().authorize(query.utoken.as_deref())?;

    let filename = required(&query.filename, "filename")?;
    let file_size: u64 = parse_number(required(&query.file_size, "file_size")?, "file_size")?;

    let started = state.transfers().start_upload(filename, file_size).await?;
    Ok(Json(started))
}

/// POST /upload/chunk?file_id=...&chunk_id=...&token=...
///
/// The chunk bytes are the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, TransferError> {
    let file_id = required(&query.file_id, "file_id")?;
    let chunk_id: usize = parse_number(required(&query.chunk_id, "chunk_id")?, "chunk_id")?;
    let token = required_token(&query.token)?;

    let response = state
        .transfers()
        .upload_chunk(file_id, chunk_id, token, &body)
        .await?;
    Ok(Json(response))
}

/// POST /upload/finish?file_id=...&token=...
async fn finish_upload(
    State(state): State<AppState>,
    Query(query): Query<FinishQuery>,
) -> Result<Json<FinishResponse>, TransferError> {
    let file_id = required(&query.file_id, "file_id")?;
    let token = required_token(&query.token)?;

    let finished = state.transfers().finish_upload(file_id, token).await?;
    Ok(Json(finished))
}

/// GET /info/:code
async fn info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<GrantView>, TransferError> {
    let view = state.transfers().info(&code).await?;
    Ok(Json(view))
}

/// GET /download/:code
///
/// Every successful response spends one download.
async fn download(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Response, TransferError> {
    let OpenedArtifact { artifact, file } = state.transfers().download(&code).await?;

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.filename),
        ),
        (header::CONTENT_LENGTH, HeaderValue::from(artifact.size_bytes)),
    ];

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// Attachment disposition with an ASCII fallback name and the exact UTF-8 name
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    );

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
