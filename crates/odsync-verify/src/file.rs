use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::hasher::{Hasher, Sha256Hasher};
use crate::Result;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 of a file in a single streaming pass.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256Hasher::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Hex form of [`sha256_file`], as stored in sidecar documents.
pub fn sha256_file_hex(path: impl AsRef<Path>) -> Result<String> {
    Ok(hex::encode(sha256_file(path)?))
}

/// Parse a 32-byte hex digest, as carried by strong ETags on some origins.
///
/// Surrounding double quotes are stripped first. Returns `None` for anything
/// that is not exactly 64 hex characters, including weak (`W/`) validators.
pub fn parse_sha256_hex(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim().trim_matches('"');
    if trimmed.len() != 64 {
        return None;
    }
    hex::decode(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn hashes_file_contents() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let digest = sha256_file(file.path()).unwrap();
        assert_eq!(digest, Sha256Hasher::digest(b"hello world"));
        assert_eq!(
            sha256_file_hex(file.path()).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn empty_file_hashes_to_empty_digest() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(
            sha256_file_hex(file.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn parses_strong_hex_etag() {
        let digest = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert!(parse_sha256_hex(digest).is_some());
        assert!(parse_sha256_hex(&format!("\"{digest}\"")).is_some());
        assert!(parse_sha256_hex("\"xyzzy\"").is_none());
        assert!(parse_sha256_hex(&format!("W/\"{digest}\"")).is_none());
    }
}
