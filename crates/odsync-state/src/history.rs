use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// One download attempt, appended to `<state>/downloads/history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub resource_url: String,
    pub strategy: String,
    pub start: String,
    pub end: String,
    /// Bytes actually written during this attempt.
    pub bytes: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dest_path: PathBuf,
    pub duration_s: f64,
}

/// Append-only attempt log. Appends are single fsynced lines, so record
/// boundaries survive concurrent processes and crashes.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    /// Log under the given state directory (`<state>/downloads/history.jsonl`).
    pub fn in_state_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("downloads").join("history.jsonl"),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        Ok(odsync_fs::append_record(&self.path, entry)?)
    }

    /// The most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = odsync_fs::read_records(&self.path)?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(url: &str, ok: bool) -> HistoryEntry {
        HistoryEntry {
            resource_url: url.into(),
            strategy: "s1_dynamic".into(),
            start: "2026-01-01T00:00:00Z".into(),
            end: "2026-01-01T00:00:01Z".into(),
            bytes: 10,
            ok,
            error: if ok { None } else { Some("stalled".into()) },
            dest_path: PathBuf::from("/d/f.json"),
            duration_s: 1.0,
        }
    }

    #[test]
    fn appends_and_tails() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::in_state_dir(dir.path());

        for i in 0..5 {
            log.append(&entry(&format!("https://x/{i}"), i % 2 == 0))
                .unwrap();
        }

        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].resource_url, "https://x/3");
        assert_eq!(tail[1].resource_url, "https://x/4");
    }

    #[test]
    fn error_field_is_omitted_when_ok() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::in_state_dir(dir.path());
        log.append(&entry("https://x/ok", true)).unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(!raw.contains("\"error\""));
    }
}
