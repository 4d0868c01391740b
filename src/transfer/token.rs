//! Identifier, secret and share code generation.

use rand::Rng;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Upload token length in bytes (produces 32 hex characters).
const UPLOAD_TOKEN_BYTES: usize = 16;

/// Longest key accepted for a persisted record.
const MAX_RECORD_KEY_LEN: usize = 64;

/// Generates a file ID from a random (v4) UUID, 32 lowercase hex characters.
pub fn generate_file_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a CSPRNG upload token as a 32-character lowercase hex string.
pub fn generate_upload_token() -> String {
    let mut bytes = [0u8; UPLOAD_TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Generates a uniformly distributed decimal code of `digits` digits,
/// zero padded.
pub fn generate_share_code(digits: usize) -> String {
    let upper = 10u64.pow(digits as u32);
    let value = rand::thread_rng().gen_range(0..upper);
    format!("{:0width$}", value, width = digits)
}

/// Validates a received token against the expected value.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(received: &str, expected: &str) -> bool {
    received.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Whether `key` may be used as a storage or record key.
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_RECORD_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_alphanumeric())
}
