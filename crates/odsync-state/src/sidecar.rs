use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::bitmap::SegmentMap;

/// Per-file transfer state, persisted next to the destination as
/// `<dest>.meta.json`.
///
/// A sidecar is terminal once `sha256` and `downloaded_at` are both set; the
/// destination file exists if and only if its sidecar is terminal. While a
/// transfer is in flight only `<dest>.part` and the sidecar exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub url: String,
    pub dataset_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_ranges: Option<bool>,

    /// Set only on successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Set only on successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,
    /// Last strategy that touched the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<SegmentMap>,

    /// Monotonically non-decreasing except at validator-change resets.
    #[serde(default)]
    pub bytes_written: u64,
    /// Strategy invocations attempted for this resource.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Sidecar {
    pub fn new(url: impl Into<String>, dataset_slug: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dataset_slug: dataset_slug.into(),
            resource_name: None,
            etag: None,
            last_modified: None,
            content_length: None,
            accept_ranges: None,
            sha256: None,
            downloaded_at: None,
            strategy: None,
            segments: None,
            bytes_written: 0,
            retries: 0,
            notes: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sha256.is_some() && self.downloaded_at.is_some()
    }

    /// Whether a terminal sidecar still satisfies the plan's expectations.
    ///
    /// An expectation that the plan does not carry is treated as satisfied;
    /// a carried expectation must match the stored value exactly.
    pub fn matches_expectations(
        &self,
        expected_etag: Option<&str>,
        expected_size: Option<u64>,
    ) -> bool {
        if let Some(expected) = expected_etag
            && self.etag.as_deref() != Some(expected)
        {
            return false;
        }
        if let Some(expected) = expected_size
            && self.content_length != Some(expected)
        {
            return false;
        }
        true
    }

    /// Recompute `bytes_written` from the segment bitmap when one exists.
    pub fn recompute_bytes_written(&mut self) {
        if let (Some(segments), Some(length)) = (&self.segments, self.content_length) {
            self.bytes_written = segments.bytes_covered(length);
        }
    }
}

/// Path of the metadata document for `dest`.
pub fn sidecar_path(dest: &Path) -> PathBuf {
    suffixed(dest, ".meta.json")
}

/// Path of the working partial file for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    suffixed(dest, ".part")
}

fn suffixed(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    dest.with_file_name(name)
}

/// Current instant as an RFC 3339 UTC string, the timestamp form used in
/// sidecars and history records.
pub fn utc_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_append_suffixes() {
        let dest = Path::new("/data/set/file.json");
        assert_eq!(
            sidecar_path(dest),
            Path::new("/data/set/file.json.meta.json")
        );
        assert_eq!(partial_path(dest), Path::new("/data/set/file.json.part"));
    }

    #[test]
    fn terminal_requires_both_fields() {
        let mut sidecar = Sidecar::new("https://example.org/f", "set");
        assert!(!sidecar.is_terminal());

        sidecar.sha256 = Some("00".repeat(32));
        assert!(!sidecar.is_terminal());

        sidecar.downloaded_at = Some(utc_timestamp());
        assert!(sidecar.is_terminal());
    }

    #[test]
    fn expectation_matching() {
        let mut sidecar = Sidecar::new("https://example.org/f", "set");
        sidecar.etag = Some("\"abc\"".into());
        sidecar.content_length = Some(100);

        assert!(sidecar.matches_expectations(None, None));
        assert!(sidecar.matches_expectations(Some("\"abc\""), Some(100)));
        assert!(!sidecar.matches_expectations(Some("\"def\""), Some(100)));
        assert!(!sidecar.matches_expectations(Some("\"abc\""), Some(101)));
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let sidecar = Sidecar::new("https://example.org/f", "set");
        let json = serde_json::to_string(&sidecar).unwrap();
        assert!(!json.contains("sha256"));
        assert!(!json.contains("segments"));
        assert!(json.contains("\"bytes_written\":0"));
    }
}
