//! Upload types for the chunk assembly protocol

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Read buffer used when streaming chunks and digesting artifacts: 64KB
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Default delay before an emptied chunk container is removed
pub const DEFAULT_CLEANUP_DELAY_MS: u64 = 1000;

/// Longest name accepted for a file hash, chunk key or artifact (common NAME_MAX)
pub const MAX_SEGMENT_LEN: usize = 255;

/// Prefix marking in-flight temporary files (never listed as chunks or artifacts)
pub const TEMP_PREFIX: char = '.';

// ============================================================================
// Chunk Keys
// ============================================================================

/// A chunk key such as `"3-a1b2"` or `"3"`.
///
/// The leading run of ASCII digits is the ordering index. Keys compare by
/// that index numerically first, then by the full key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    index: u64,
    raw: String,
}

impl ChunkKey {
    /// Parse and validate a chunk key
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        validate_segment("chunkKey", raw)?;

        let digits: &str = {
            let end = raw
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(raw.len());
            &raw[..end]
        };

        if digits.is_empty() {
            return Err(UploadError::ValidationError(format!(
                "chunkKey must start with a numeric index: {}",
                raw
            )));
        }

        let index = digits.parse::<u64>().map_err(|_| {
            UploadError::ValidationError(format!("chunkKey index out of range: {}", raw))
        })?;

        Ok(Self {
            index,
            raw: raw.to_string(),
        })
    }

    /// Numeric ordering index
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for ChunkKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for ChunkKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check that a client-supplied name is a single, visible path segment.
///
/// Used for file hashes, chunk keys and artifact names, all of which end up
/// as directory entries.
pub fn validate_segment(field: &str, value: &str) -> Result<(), UploadError> {
    if value.is_empty() {
        return Err(UploadError::ValidationError(format!("{} is required", field)));
    }

    // A leading dot also rules out "." and ".."
    if value.starts_with(TEMP_PREFIX) || value.contains(['/', '\\', '\0']) {
        return Err(UploadError::ValidationError(format!(
            "{} is not a valid name: {}",
            field, value
        )));
    }

    if value.len() > MAX_SEGMENT_LEN {
        return Err(UploadError::ValidationError(format!(
            "{} exceeds {} bytes",
            field, MAX_SEGMENT_LEN
        )));
    }

    Ok(())
}

// ============================================================================
// Request Types
// ============================================================================

/// Query for the instant-upload check.
///
/// Fields are optional so that missing values surface as validation errors
/// in the response envelope rather than extractor rejections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckQuery {
    pub file_hash: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
}

/// Request to assemble all chunks of an upload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
}

/// Request to verify an assembled artifact against its declared hash
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub file_hash: Option<String>,
    pub file_name: Option<String>,
}

/// Pull a required string field out of a request
pub fn require_str<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, UploadError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(UploadError::ValidationError(format!("{} is required", field))),
    }
}

/// Pull a required numeric field out of a request
pub fn require_u64(field: &str, value: Option<u64>) -> Result<u64, UploadError> {
    value.ok_or_else(|| UploadError::ValidationError(format!("{} is required", field)))
}

// ============================================================================
// Response Types
// ============================================================================

/// Envelope wrapping every successful response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Numeric status code (mirrors the HTTP status)
    pub code: u16,

    /// Human-readable message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            code: 200,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Result of the instant-upload check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    /// Whether a matching artifact already exists
    pub exists: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactInfo>,

    /// Chunk keys already staged for this file hash (for resuming)
    pub uploaded_chunks: Vec<String>,
}

/// Acknowledgement for a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub file_hash: String,
    pub chunk_key: String,
    pub size: u64,
}

/// Reference to an assembled artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub file_name: String,
    pub size: u64,

    /// Public URL under which the artifact is served
    pub url: String,
}

/// Outcome of an integrity check. A mismatch is reported here, never as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub verified: bool,
    pub expected: String,
    pub actual: String,
}

// ============================================================================
// Stored State
// ============================================================================

/// Metadata for a completed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub name: String,
    pub size: u64,
    pub create_time: DateTime<Utc>,
}

/// Summary of the chunks staged for one file hash
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub file_hash: String,

    /// Stored chunk keys in merge order
    pub chunks: Vec<String>,

    /// Total bytes staged so far
    pub stored_bytes: u64,

    /// When the chunk container was created
    pub created_at: DateTime<Utc>,
}

/// Result of checking for an existing artifact
#[derive(Debug, Clone)]
pub struct DedupResult {
    pub found: bool,
    pub metadata: Option<ArtifactInfo>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No chunks uploaded for {0}")]
    NoChunks(String),

    #[error("Merge already in progress for {0}")]
    MergeInProgress(String),

    #[error("Assembled size mismatch: declared {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoChunks(_) => StatusCode::BAD_REQUEST,
            Self::MergeInProgress(_) => StatusCode::CONFLICT,
            Self::SizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NoChunks(_) => "NO_CHUNKS",
            Self::MergeInProgress(_) => "MERGE_IN_PROGRESS",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
