use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::{Error, Result};

/// Durably write `content` to `path`.
///
/// The write goes to a sibling `<name>.tmp` in the same directory, the file is
/// fsynced, renamed over the target, and finally the directory entry is
/// fsynced. Readers never observe a half-written file.
pub fn atomic_write(path: impl AsRef<Path>, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| Error::Write {
        path: path.to_path_buf(),
        source: std::io::Error::other("no parent directory"),
    })?;

    let tmp_path = sibling_tmp(path);

    let mut file = File::create(&tmp_path).map_err(|e| Error::write(&tmp_path, e))?;
    file.write_all(content)
        .map_err(|e| Error::write(&tmp_path, e))?;
    file.sync_all().map_err(|e| Error::write(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::write(path, e)
    })?;

    fsync_dir(parent)
}

/// Append one line to `path`, creating parent directories as needed.
///
/// The record is written as a single `write_all` including the trailing
/// newline and fsynced, so concurrent readers see whole lines only.
pub fn append_line(path: impl AsRef<Path>, line: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::write(path, e))?;
    file.write_all(&buf).map_err(|e| Error::write(path, e))?;
    file.sync_all().map_err(|e| Error::write(path, e))?;

    Ok(())
}

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|e| Error::CreateDir {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Fsync a directory so a preceding rename within it is durable.
pub fn fsync_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    // Windows cannot open directories for sync; the rename is still atomic.
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| Error::read(dir, e))?;
        handle.sync_all().map_err(|e| Error::write(dir, e))?;
    }
    let _ = dir;
    Ok(())
}

fn sibling_tmp(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
