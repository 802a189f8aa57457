//! Hash Verifier
//!
//! Streaming SHA-256 digests of chunks and assembled artifacts. Data is read
//! and folded incrementally, so artifacts of any size are digested in
//! constant memory.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{UploadError, VerifyResult, STREAM_BUFFER_SIZE};

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest everything readable from `reader`.
///
/// Returns the hex digest and the number of bytes consumed. Any read error
/// aborts the digest.
pub async fn digest_reader<R>(reader: &mut R) -> Result<(String, u64), UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| UploadError::IoError(format!("Failed to read stream: {}", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Digest a file on disk.
///
/// Fails closed: if fewer (or more) bytes are read than the file held when it
/// was opened, no digest is returned.
pub async fn digest_file(path: &Path) -> Result<String, UploadError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        UploadError::IoError(format!("Failed to open {}: {}", path.display(), e))
    })?;

    let expected_len = file
        .metadata()
        .await
        .map_err(|e| UploadError::IoError(format!("Failed to stat {}: {}", path.display(), e)))?
        .len();

    let (digest, read) = digest_reader(&mut file).await?;
    check_length(path, expected_len, read)?;

    Ok(digest)
}

/// A digest only counts if it covers exactly the bytes the file held at open
fn check_length(path: &Path, expected: u64, read: u64) -> Result<(), UploadError> {
    if read != expected {
        return Err(UploadError::IoError(format!(
            "Short read on {}: expected {} bytes, read {}",
            path.display(),
            expected,
            read
        )));
    }
    Ok(())
}

/// Compare the digest of `path` against a declared hash
pub async fn verify(path: &Path, expected: &str) -> Result<VerifyResult, UploadError> {
    let actual = digest_file(path).await?;
    let verified = actual.eq_ignore_ascii_case(expected.trim());

    if !verified {
        tracing::warn!(
            path = %path.display(),
            expected = %expected,
            actual = %actual,
            "Integrity check failed"
        );
    }

    Ok(VerifyResult {
        verified,
        expected: expected.to_string(),
        actual,
    })
}

// ============================================================================
// Tests
// ============================================================================
