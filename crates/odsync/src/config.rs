use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use odsync_fetch::{DownloaderConfig, HttpConfig};

/// Top-level configuration, loaded from `<state>/odsync.toml`.
///
/// Every section has full defaults so a missing file means a working setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the mirrored tree; plan destinations live below it.
    pub root_dir: PathBuf,
    /// Catalog base URL, used by the crawling/planning tooling upstream of
    /// the download core.
    pub base_url: String,
    /// State directory (default `~/.odsync`).
    pub state_dir: Option<PathBuf>,

    pub http: HttpConfig,
    pub downloader: DownloaderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl Config {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Load configuration and bootstrap the state directory tree.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_state_dir().join("odsync.toml"));

        let config: Config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Config::default()
        };

        let state = config.state_dir();
        for subdir in ["catalog", "local", "plans", "downloads"] {
            odsync_fs::ensure_dir(state.join(subdir))
                .with_context(|| format!("creating state directory {}", state.display()))?;
        }

        Ok(config)
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".odsync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimal_file_keeps_defaults_and_bootstraps_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odsync.toml");
        std::fs::write(
            &path,
            format!("state_dir = \"{}\"", dir.path().join("state").display()),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.downloader.retries_per_strategy, 3);
        assert!(dir.path().join("state/downloads").is_dir());
    }

    #[test]
    fn sections_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odsync.toml");
        std::fs::write(
            &path,
            format!(
                r#"
state_dir = "{}"

[downloader]
strategies = ["s2_sparse", "s1_dynamic"]
sparse_segment_mb = 8

[http]
timeout_read_s = 120

[logging]
level = "debug"
"#,
                dir.path().join("state").display()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.downloader.sparse_segment_mb, 8);
        assert_eq!(config.downloader.strategies.len(), 2);
        assert_eq!(config.http.timeout_read_s, 120);
        assert_eq!(config.logging.level, "debug");
        // untouched knobs keep defaults
        assert_eq!(config.http.timeout_connect_s, 10);
    }
}
