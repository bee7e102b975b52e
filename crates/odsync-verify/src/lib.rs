//! Content verification primitives for downloaded artifacts.
//!
//! Provides incremental hashing behind a minimal [`Hasher`] trait plus
//! streaming whole-file digests, without enforcing any verification policy.
//! Callers decide what to compare against and what a mismatch means.

mod error;
mod file;
mod hasher;

pub use error::{Result, VerifyError};
pub use file::{parse_sha256_hex, sha256_file, sha256_file_hex};
pub use hasher::{DigestHasher, Hasher, Sha256Hasher};
