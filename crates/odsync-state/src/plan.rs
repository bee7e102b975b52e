use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Why the planner scheduled a resource for download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    Missing,
    EtagChanged,
    SizeChanged,
}

/// One entry of a download plan, as written by the planner to
/// `<state>/plans/*.ndjson`. Immutable input to the download core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub dataset_slug: String,
    pub resource_url: String,
    pub dest_path: PathBuf,
    pub reason: PlanReason,
    #[serde(default, alias = "size", skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(default, alias = "etag", skip_serializing_if = "Option::is_none")]
    pub expected_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

/// Load a plan file, skipping malformed lines.
pub fn read_plan(path: impl AsRef<Path>) -> Result<Vec<PlanItem>> {
    Ok(odsync_fs::read_records(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_plan_lines_with_aliases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.ndjson");

        odsync_fs::append_line(
            &path,
            r#"{"dataset_slug":"a","resource_url":"https://x/f.json","dest_path":"/d/f.json","reason":"missing","size":42,"etag":"\"e1\""}"#,
        )
        .unwrap();
        odsync_fs::append_line(
            &path,
            r#"{"dataset_slug":"b","resource_url":"https://x/g.json","dest_path":"/d/g.json","reason":"etag_changed","expected_size":7}"#,
        )
        .unwrap();

        let plan = read_plan(&path).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].reason, PlanReason::Missing);
        assert_eq!(plan[0].expected_size, Some(42));
        assert_eq!(plan[0].expected_etag.as_deref(), Some("\"e1\""));
        assert_eq!(plan[1].reason, PlanReason::EtagChanged);
        assert_eq!(plan[1].expected_size, Some(7));
    }
}
