//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - GET /api/v1/upload/check - Instant-upload check by name and size
//! - PUT /api/v1/upload/chunks/:file_hash/:chunk_key - Upload a chunk (raw body)
//! - GET /api/v1/upload/chunks/:file_hash - Staged chunks for an upload
//! - DELETE /api/v1/upload/chunks/:file_hash - Cancel an upload
//! - POST /api/v1/upload/merge - Assemble chunks into the final file
//! - POST /api/v1/upload/verify - Compare an artifact against its hash
//! - GET /api/v1/upload/files - List completed files

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    self, require_str, require_u64, validate_segment, ApiResponse, ArtifactInfo, ArtifactRef,
    CheckQuery, CheckResponse, ChunkKey, ChunkReceipt, MergeRequest, UploadError, UploadSession,
    VerifyRequest, VerifyResult,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    kind: &'static str,
    message: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Upload request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Upload request rejected");
        }

        let body = Json(ErrorResponse {
            code: status.as_u16(),
            kind: self.kind(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_size: usize) -> Router<AppState> {
    Router::new()
        .route("/check", get(check_existing))
        .route(
            "/chunks/:file_hash/:chunk_key",
            put(upload_chunk).post(upload_chunk),
        )
        .route("/chunks/:file_hash", get(get_upload).delete(cancel_upload))
        .route("/merge", post(merge))
        .route("/verify", post(verify))
        .route("/files", get(list_files))
        .layer(DefaultBodyLimit::max(max_chunk_size))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/upload/check?fileHash=&fileName=&size=
///
/// Reports whether the file already exists, plus any chunks already staged
/// so an interrupted upload can resume.
async fn check_existing(
    State(state): State<AppState>,
    query: Result<Query<CheckQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<CheckResponse>>, UploadError> {
    let Query(query) = query.map_err(|e| UploadError::ValidationError(e.body_text()))?;
    let file_hash = require_str("fileHash", &query.file_hash)?;
    let file_name = require_str("fileName", &query.file_name)?;
    let size = require_u64("size", query.size)?;
    validate_segment("fileHash", file_hash)?;
    validate_segment("fileName", file_name)?;

    let dedup = state.dedup().exists(file_name, size).await?;

    let uploaded_chunks = if dedup.found {
        Vec::new()
    } else {
        match state.chunk_store().session(file_hash).await {
            Ok(session) => session.chunks,
            Err(UploadError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        }
    };

    let message = if dedup.found { "file exists" } else { "file not found" };

    Ok(Json(ApiResponse::ok(
        message,
        CheckResponse {
            exists: dedup.found,
            metadata: dedup.metadata,
            uploaded_chunks,
        },
    )))
}

/// PUT /api/v1/upload/chunks/:file_hash/:chunk_key
///
/// Store one chunk. The chunk data is the raw request body. Re-sending a key
/// replaces the earlier bytes.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((file_hash, chunk_key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ApiResponse<ChunkReceipt>>, UploadError> {
    validate_segment("fileHash", &file_hash)?;
    let key = ChunkKey::parse(&chunk_key)?;

    let size = state.chunk_store().put(&file_hash, &key, &body).await?;

    Ok(Json(ApiResponse::ok(
        "chunk stored",
        ChunkReceipt {
            file_hash,
            chunk_key,
            size,
        },
    )))
}

/// GET /api/v1/upload/chunks/:file_hash
async fn get_upload(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> Result<Json<ApiResponse<UploadSession>>, UploadError> {
    validate_segment("fileHash", &file_hash)?;
    let session = state.chunk_store().session(&file_hash).await?;
    Ok(Json(ApiResponse::ok("ok", session)))
}

/// DELETE /api/v1/upload/chunks/:file_hash
///
/// Drop every staged chunk of an upload. Refused while it is being merged.
async fn cancel_upload(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> Result<StatusCode, UploadError> {
    validate_segment("fileHash", &file_hash)?;

    let _guard = state
        .merger()
        .locks()
        .try_acquire(&file_hash)
        .ok_or_else(|| UploadError::MergeInProgress(file_hash.clone()))?;

    let session = state.chunk_store().session(&file_hash).await?;
    state.chunk_store().remove_container(&file_hash).await;

    tracing::info!(
        file_hash = %file_hash,
        chunks = session.chunks.len(),
        "Upload cancelled"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/upload/merge
///
/// Assemble staged chunks into the final file. Does not verify the hash.
async fn merge(
    State(state): State<AppState>,
    request: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<ArtifactRef>>, UploadError> {
    let Json(request) = request.map_err(|e| UploadError::ValidationError(e.body_text()))?;
    let file_hash = require_str("fileHash", &request.file_hash)?;
    let file_name = require_str("fileName", &request.file_name)?;
    let size = require_u64("size", request.size)?;

    let artifact = state.merger().merge(file_hash, file_name, size).await?;

    Ok(Json(ApiResponse::ok("file merged", artifact)))
}

/// POST /api/v1/upload/verify
///
/// A digest mismatch is a `verified: false` result, not an error.
async fn verify(
    State(state): State<AppState>,
    request: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<VerifyResult>>, UploadError> {
    let Json(request) = request.map_err(|e| UploadError::ValidationError(e.body_text()))?;
    let file_hash = require_str("fileHash", &request.file_hash)?;
    let file_name = require_str("fileName", &request.file_name)?;

    if state.artifacts().stat(file_name).await?.is_none() {
        return Err(UploadError::NotFound(format!("file {}", file_name)));
    }

    let path = state.artifacts().path(file_name)?;
    let result = upload::verify(&path, file_hash).await?;

    let message = if result.verified {
        "file verified"
    } else {
        "hash mismatch"
    };

    Ok(Json(ApiResponse::ok(message, result)))
}

/// GET /api/v1/upload/files
async fn list_files(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ArtifactInfo>>>, UploadError> {
    let files = state.artifacts().list().await?;
    Ok(Json(ApiResponse::ok("ok", files)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::upload::compute_hash;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app() -> (TempDir, AppState, Router) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.chunk_dir = temp_dir.path().join("chunks");
        config.storage.artifact_dir = temp_dir.path().join("files");
        config.upload.cleanup_delay_ms = 10;

        let state = AppState::new(config);
        let app = crate::routes::app(state.clone());
        (temp_dir, state, app)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn put_chunk(file_hash: &str, key: &str, data: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method(Method::PUT)
            .uri(format!("/api/v1/upload/chunks/{}/{}", file_hash, key))
            .body(Body::from(data))
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_upload() {
        let (_temp_dir, _state, app) = test_app();

        let (status, body) = send(
            &app,
            get("/api/v1/upload/check?fileHash=H1&fileName=out.bin&size=6"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["exists"], false);

        for (key, data) in [("0-a", b"AA"), ("2-c", b"CC"), ("1-b", b"BB")] {
            let (status, body) = send(&app, put_chunk("H1", key, data)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["code"], 200);
            assert_eq!(body["data"]["size"], 2);
        }

        let (status, body) = send(&app, get("/api/v1/upload/chunks/H1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["chunks"], json!(["0-a", "1-b", "2-c"]));
        assert_eq!(body["data"]["storedBytes"], 6);

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/upload/merge",
                json!({ "fileHash": "H1", "fileName": "out.bin", "size": 6 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["url"], "/files/out.bin");
        assert_eq!(body["data"]["size"], 6);

        let digest = compute_hash(b"AABBCC");
        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/upload/verify",
                json!({ "fileHash": digest, "fileName": "out.bin" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["verified"], true);

        let (_, body) = send(
            &app,
            post_json(
                "/api/v1/upload/verify",
                json!({ "fileHash": "bogus", "fileName": "out.bin" }),
            ),
        )
        .await;
        assert_eq!(body["data"]["verified"], false);
        assert_eq!(body["data"]["expected"], "bogus");
        assert_eq!(body["data"]["actual"], digest);

        let (_, body) = send(
            &app,
            get("/api/v1/upload/check?fileHash=H1&fileName=out.bin&size=6"),
        )
        .await;
        assert_eq!(body["data"]["exists"], true);
        assert_eq!(body["data"]["metadata"]["name"], "out.bin");

        let (_, body) = send(
            &app,
            get("/api/v1/upload/check?fileHash=H1&fileName=out.bin&size=7"),
        )
        .await;
        assert_eq!(body["data"]["exists"], false);

        let (status, body) = send(&app, get("/api/v1/upload/files")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["name"], "out.bin");
        assert_eq!(body["data"][0]["size"], 6);
        assert!(body["data"][0]["createTime"].is_string());
    }

    #[tokio::test]
    async fn test_check_reports_staged_chunks() {
        let (_temp_dir, _state, app) = test_app();
        send(&app, put_chunk("H1", "1-b", b"BB")).await;
        send(&app, put_chunk("H1", "0-a", b"AA")).await;

        let (_, body) = send(
            &app,
            get("/api/v1/upload/check?fileHash=H1&fileName=out.bin&size=6"),
        )
        .await;
        assert_eq!(body["data"]["exists"], false);
        assert_eq!(body["data"]["uploadedChunks"], json!(["0-a", "1-b"]));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (temp_dir, _state, app) = test_app();

        let (status, body) = send(&app, get("/api/v1/upload/check?fileName=a.bin&size=1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");
        assert_eq!(body["code"], 400);

        let (status, body) = send(
            &app,
            get("/api/v1/upload/check?fileHash=H1&fileName=a.bin&size=big"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");

        let (status, body) = send(&app, put_chunk("H1", "abc", b"AA")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");

        let (status, body) = send(
            &app,
            post_json("/api/v1/upload/merge", json!({ "fileHash": "H1", "size": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/upload/merge",
                json!({ "fileHash": "H1", "fileName": "../escape", "size": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Nothing touched storage
        assert!(!temp_dir.path().join("chunks").exists());
    }

    #[tokio::test]
    async fn test_merge_without_chunks() {
        let (temp_dir, _state, app) = test_app();

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/upload/merge",
                json!({ "fileHash": "H1", "fileName": "out.bin", "size": 0 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "NO_CHUNKS");
        assert!(!temp_dir.path().join("files").join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_merge_in_progress_conflict() {
        let (_temp_dir, state, app) = test_app();
        send(&app, put_chunk("H1", "0-a", b"AA")).await;

        let _guard = state.merger().locks().try_acquire("H1").unwrap();

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/upload/merge",
                json!({ "fileHash": "H1", "fileName": "out.bin", "size": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "MERGE_IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_verify_missing_artifact() {
        let (_temp_dir, _state, app) = test_app();

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/upload/verify",
                json!({ "fileHash": "H1", "fileName": "missing.bin" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_upload() {
        let (temp_dir, _state, app) = test_app();
        send(&app, put_chunk("H1", "0-a", b"AA")).await;

        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/api/v1/upload/chunks/H1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!temp_dir.path().join("chunks").join("H1").exists());

        let (status, body) = send(&app, get("/api/v1/upload/chunks/H1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_health() {
        let (_temp_dir, _state, app) = test_app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }
}
