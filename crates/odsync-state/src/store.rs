use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::sidecar::{partial_path, sidecar_path, utc_timestamp, Sidecar};
use crate::{Result, StateError};

/// Serialized access to sidecar documents, keyed by destination path.
///
/// All mutations are read-modify-write under a per-path async mutex, and every
/// persisted form goes through [`odsync_fs::atomic_write`], so sidecar updates
/// for one resource are totally ordered and a crash never leaves a torn
/// document.
#[derive(Debug, Default)]
pub struct SidecarStore {
    locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SidecarStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn guard(&self, dest: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("sidecar lock table poisoned");
            Arc::clone(locks.entry(dest.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    /// Load the sidecar for `dest`, if one exists.
    ///
    /// An unreadable or unparsable document is treated as absent: the sidecar
    /// is advisory state and the transfer restarts from scratch rather than
    /// refusing to run.
    pub async fn load(&self, dest: &Path) -> Result<Option<Sidecar>> {
        let _guard = self.guard(dest).await;
        Ok(read_sidecar(dest))
    }

    /// Load the sidecar for `dest`, creating and persisting it on first use.
    pub async fn load_or_init<F>(&self, dest: &Path, init: F) -> Result<Sidecar>
    where
        F: FnOnce() -> Sidecar,
    {
        let _guard = self.guard(dest).await;
        if let Some(sidecar) = read_sidecar(dest) {
            return Ok(sidecar);
        }
        let sidecar = init();
        write_sidecar(dest, &sidecar)?;
        Ok(sidecar)
    }

    /// Read-modify-write the sidecar for `dest` and persist the result.
    pub async fn update<F>(&self, dest: &Path, mutate: F) -> Result<Sidecar>
    where
        F: FnOnce(&mut Sidecar),
    {
        let _guard = self.guard(dest).await;
        let mut sidecar = read_sidecar(dest).unwrap_or_else(|| Sidecar::new("", ""));
        mutate(&mut sidecar);
        write_sidecar(dest, &sidecar)?;
        Ok(sidecar)
    }

    /// Finalize a transfer: rename `<dest>.part` over `<dest>`, then write the
    /// terminal sidecar carrying the digest and commit timestamp.
    ///
    /// The rename happens first, per the sidecar lifecycle: a crash between
    /// the two steps leaves the final file with a non-terminal sidecar, which
    /// the next run re-verifies and finalizes without any network I/O.
    pub async fn commit(&self, dest: &Path, sha256_hex: &str, strategy: &str) -> Result<Sidecar> {
        let _guard = self.guard(dest).await;
        let part = partial_path(dest);
        if !part.exists() {
            return Err(StateError::MissingPartial { path: part });
        }

        fs::rename(&part, dest).map_err(|e| StateError::io(dest, e))?;
        if let Some(parent) = dest.parent() {
            odsync_fs::fsync_dir(parent)?;
        }

        let mut sidecar = read_sidecar(dest).unwrap_or_else(|| Sidecar::new("", ""));
        sidecar.sha256 = Some(sha256_hex.to_string());
        sidecar.downloaded_at = Some(utc_timestamp());
        sidecar.strategy = Some(strategy.to_string());
        sidecar.notes = None;
        write_sidecar(dest, &sidecar)?;
        Ok(sidecar)
    }

    /// Write the terminal sidecar for a destination that already holds the
    /// final bytes (recovery from a crash between rename and sidecar write).
    pub async fn finalize_existing(
        &self,
        dest: &Path,
        sha256_hex: &str,
        strategy: &str,
    ) -> Result<Sidecar> {
        let _guard = self.guard(dest).await;
        let mut sidecar = read_sidecar(dest).unwrap_or_else(|| Sidecar::new("", ""));
        sidecar.sha256 = Some(sha256_hex.to_string());
        sidecar.downloaded_at = Some(utc_timestamp());
        sidecar.strategy = Some(strategy.to_string());
        sidecar.notes = None;
        write_sidecar(dest, &sidecar)?;
        Ok(sidecar)
    }

    /// Discard all partial progress for `dest`.
    ///
    /// Truncates the partial file, clears the bitmap and `bytes_written`, and
    /// records `note`. This is the only path that shrinks `bytes_written`.
    pub async fn reset_partial(&self, dest: &Path, note: &str) -> Result<Sidecar> {
        let _guard = self.guard(dest).await;
        let part = partial_path(dest);
        if part.exists() {
            fs::remove_file(&part).map_err(|e| StateError::io(&part, e))?;
        }

        let mut sidecar = read_sidecar(dest).unwrap_or_else(|| Sidecar::new("", ""));
        if let Some(segments) = sidecar.segments.as_mut() {
            segments.bitmap.clear_all();
        }
        sidecar.bytes_written = 0;
        sidecar.sha256 = None;
        sidecar.downloaded_at = None;
        sidecar.notes = Some(note.to_string());
        write_sidecar(dest, &sidecar)?;
        Ok(sidecar)
    }

    /// Handle an integrity failure on a finalized or about-to-finalize file:
    /// unlink the final file if present, drop all partial progress, and mark
    /// the sidecar `corrupted` so the cascade re-enters conservatively.
    pub async fn reset_corrupted(&self, dest: &Path) -> Result<Sidecar> {
        {
            let _guard = self.guard(dest).await;
            if dest.exists() {
                fs::remove_file(dest).map_err(|e| StateError::io(dest, e))?;
            }
        }
        self.reset_partial(dest, "corrupted").await
    }
}

fn read_sidecar(dest: &Path) -> Option<Sidecar> {
    let path = sidecar_path(dest);
    let raw = fs::read(&path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn write_sidecar(dest: &Path, sidecar: &Sidecar) -> Result<()> {
    let path = sidecar_path(dest);
    let raw = serde_json::to_vec_pretty(sidecar)?;
    Ok(odsync_fs::atomic_write(path, &raw)?)
}
