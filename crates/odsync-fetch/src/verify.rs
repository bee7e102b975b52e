//! Post-transfer integrity checks.
//!
//! After a strategy reports success the manager verifies the partial file in
//! one streaming pass: size against the advertised length, SHA-256 always,
//! and, when the stored ETag is a strong 32-byte hex digest, the digest
//! against that validator.

use std::path::Path;

use odsync_state::{partial_path, Sidecar};
use odsync_verify::{parse_sha256_hex, sha256_file};

use crate::error::FetchFailure;

/// Verify the partial file for `dest`, returning its hex digest on success.
pub(crate) async fn verify_partial(dest: &Path, sidecar: &Sidecar) -> Result<String, FetchFailure> {
    verify_file(&partial_path(dest), sidecar).await
}

/// Verify an arbitrary on-disk artifact against the sidecar's expectations.
pub(crate) async fn verify_file(path: &Path, sidecar: &Sidecar) -> Result<String, FetchFailure> {
    let path = path.to_path_buf();
    let expected_len = sidecar.content_length;
    let validator = sidecar.etag.as_deref().and_then(parse_sha256_hex);

    tokio::task::spawn_blocking(move || {
        let meta = std::fs::metadata(&path).map_err(|e| FetchFailure::io(&e))?;
        if let Some(expected) = expected_len
            && meta.len() != expected
        {
            return Err(FetchFailure::integrity("size_mismatch"));
        }

        let digest = sha256_file(&path).map_err(|e| match e {
            odsync_verify::VerifyError::Io(io) => FetchFailure::io(&io),
            other => FetchFailure::retryable(format!("verify:{other}")),
        })?;

        if let Some(expected) = validator
            && digest != expected
        {
            return Err(FetchFailure::integrity("sha256_mismatch"));
        }

        Ok(hex::encode(digest))
    })
    .await
    .map_err(|_| FetchFailure::fatal("verify_task"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use odsync_verify::Sha256Hasher;
    use tempfile::tempdir;

    fn sidecar_with(len: Option<u64>, etag: Option<String>) -> Sidecar {
        let mut sidecar = Sidecar::new("https://x/f", "set");
        sidecar.content_length = len;
        sidecar.etag = etag;
        sidecar
    }

    #[tokio::test]
    async fn accepts_matching_size_and_digest() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(partial_path(&dest), b"payload").unwrap();

        let etag = hex::encode(Sha256Hasher::digest(b"payload"));
        let sidecar = sidecar_with(Some(7), Some(format!("\"{etag}\"")));

        let sha = verify_partial(&dest, &sidecar).await.unwrap();
        assert_eq!(sha, etag);
    }

    #[tokio::test]
    async fn rejects_size_mismatch() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(partial_path(&dest), b"short").unwrap();

        let err = verify_partial(&dest, &sidecar_with(Some(100), None))
            .await
            .unwrap_err();
        assert_eq!(err.detail, "size_mismatch");
    }

    #[tokio::test]
    async fn rejects_digest_mismatch_against_strong_etag() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(partial_path(&dest), b"payload").unwrap();

        let wrong = hex::encode(Sha256Hasher::digest(b"different"));
        let err = verify_partial(&dest, &sidecar_with(Some(7), Some(wrong)))
            .await
            .unwrap_err();
        assert_eq!(err.detail, "sha256_mismatch");
    }

    #[tokio::test]
    async fn opaque_etags_are_not_validators() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(partial_path(&dest), b"payload").unwrap();

        let sidecar = sidecar_with(Some(7), Some("\"v2-rev17\"".into()));
        assert!(verify_partial(&dest, &sidecar).await.is_ok());
    }
}
