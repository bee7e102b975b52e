use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;

const MIB: u64 = 1024 * 1024;

/// Knobs for the strategy cascade and the transfer tactics.
///
/// Defaults mirror the documented behavior: the full five-strategy order,
/// three in-strategy retries, a 300 s stall threshold, the 2/6/12 MiB dynamic
/// chunk table, 4 MiB sparse segments, 1 MiB short-connection chunks, and a
/// 32 KiB resume overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub strategies: Vec<StrategyKind>,
    pub retries_per_strategy: u32,
    pub switch_after_seconds_without_progress: u64,
    /// Chunk sizes in MiB for small / medium / large files (S1).
    pub dynamic_chunks_mb: [u64; 3],
    /// Segment size and bitmap granularity in MiB (S2).
    pub sparse_segment_mb: u64,
    /// Chunk size in KiB for short-connection transfers (S4).
    pub snail_chunks_kb: u64,
    /// How far before the high-water mark S1 re-requests on resume.
    pub overlap_bytes: u64,
    pub enable_curl: bool,
    pub curl_path: String,
    /// Token-bucket rate for probe/catalog requests, in requests per second.
    pub rate_limit_rps: f64,
    /// Plan-level parallelism; clamped to 2, never more than one manager per
    /// destination path.
    pub max_concurrency: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategyKind::S1Dynamic,
                StrategyKind::S2Sparse,
                StrategyKind::S3Curl,
                StrategyKind::S4Shortconn,
                StrategyKind::S5Tailfirst,
            ],
            retries_per_strategy: 3,
            switch_after_seconds_without_progress: 300,
            dynamic_chunks_mb: [2, 6, 12],
            sparse_segment_mb: 4,
            snail_chunks_kb: 1024,
            overlap_bytes: 32 * 1024,
            enable_curl: true,
            curl_path: "curl".into(),
            rate_limit_rps: 1.0,
            max_concurrency: 1,
        }
    }
}

impl DownloaderConfig {
    /// Dynamic chunk size for S1: <50 MB files use the small chunk,
    /// 50–300 MB the medium one, larger files the large one. Unknown sizes
    /// get the small chunk.
    pub fn dynamic_chunk_bytes(&self, content_length: Option<u64>) -> u64 {
        let [small, medium, large] = self.dynamic_chunks_mb;
        match content_length {
            None => small * MIB,
            Some(len) if len < 50 * MIB => small * MIB,
            Some(len) if len < 300 * MIB => medium * MIB,
            Some(_) => large * MIB,
        }
    }

    pub fn segment_bytes(&self) -> u64 {
        (self.sparse_segment_mb * MIB).max(1)
    }

    pub fn snail_chunk_bytes(&self) -> u64 {
        (self.snail_chunks_kb * 1024).max(1)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.switch_after_seconds_without_progress.max(1))
    }
}

/// Shared HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_connect_s: u64,
    pub timeout_read_s: u64,
    pub http2: bool,
    pub user_agent: String,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_connect_s: 10,
            timeout_read_s: 60,
            http2: false,
            user_agent: concat!("odsync/", env!("CARGO_PKG_VERSION")).into(),
            headers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_table_thresholds() {
        let config = DownloaderConfig::default();
        assert_eq!(config.dynamic_chunk_bytes(Some(10 * MIB)), 2 * MIB);
        assert_eq!(config.dynamic_chunk_bytes(Some(100 * MIB)), 6 * MIB);
        assert_eq!(config.dynamic_chunk_bytes(Some(500 * MIB)), 12 * MIB);
        assert_eq!(config.dynamic_chunk_bytes(None), 2 * MIB);
    }

    #[test]
    fn strategy_names_roundtrip_through_config() {
        let toml = r#"
            strategies = ["s4_shortconn", "s1_dynamic"]
            retries_per_strategy = 5
        "#;
        let config: DownloaderConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.strategies,
            vec![StrategyKind::S4Shortconn, StrategyKind::S1Dynamic]
        );
        assert_eq!(config.retries_per_strategy, 5);
        // untouched knobs keep their defaults
        assert_eq!(config.overlap_bytes, 32 * 1024);
    }
}
