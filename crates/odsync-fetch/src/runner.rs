//! Plan runner.
//!
//! Iterates plan items, hands each to its own cascade manager, and folds the
//! outcomes into a run summary. Sequential by default; bounded parallelism
//! never puts two managers on one destination path.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use odsync_state::{HistoryLog, PlanItem, SidecarStore};

use crate::cascade::{CascadeManager, ItemStatus};
use crate::config::DownloaderConfig;
use crate::net::{HttpTransport, RemoteInfo, TokenBucket};
use crate::stall::CancelFlag;
use crate::strategy::StrategyKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyTally {
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub committed: usize,
    pub already_complete: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub duplicate_destinations: usize,
    pub bytes: u64,
    pub by_strategy: BTreeMap<String, StrategyTally>,
    /// `(resource_url, error)` pairs for the failures.
    pub errors: Vec<(String, String)>,
    pub dry_run: bool,
    pub duration_s: f64,
}

impl RunSummary {
    /// Process exit code: 0 all ok, 20 nothing to do, 30 partial failures,
    /// 40 all downloads failed.
    pub fn exit_code(&self) -> i32 {
        if self.dry_run {
            return 0;
        }
        let acted = self.committed + self.failed + self.interrupted;
        if self.total == 0 || acted == 0 {
            return 20;
        }
        if self.failed + self.interrupted == 0 {
            0
        } else if self.committed > 0 {
            30
        } else {
            40
        }
    }

    fn absorb(&mut self, item: &PlanItem, outcome: crate::cascade::ItemOutcome) {
        self.bytes += outcome.bytes;
        let tally = outcome
            .strategy
            .map(|kind| self.by_strategy.entry(kind.as_str().to_string()).or_default());
        match outcome.status {
            ItemStatus::Committed => {
                self.committed += 1;
                if let Some(tally) = tally {
                    tally.succeeded += 1;
                }
            }
            ItemStatus::AlreadyComplete => self.already_complete += 1,
            ItemStatus::Failed | ItemStatus::Interrupted => {
                if outcome.status == ItemStatus::Failed {
                    self.failed += 1;
                } else {
                    self.interrupted += 1;
                }
                if let Some(tally) = tally {
                    tally.failed += 1;
                }
                self.errors.push((
                    item.resource_url.clone(),
                    outcome.error.unwrap_or_else(|| "unknown".into()),
                ));
            }
        }
    }
}

pub struct PlanRunner<T: HttpTransport> {
    transport: Arc<T>,
    store: Arc<SidecarStore>,
    history: Arc<HistoryLog>,
    limiter: Arc<TokenBucket>,
    config: Arc<DownloaderConfig>,
    cancel: CancelFlag,
}

impl<T: HttpTransport + 'static> PlanRunner<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<SidecarStore>,
        history: Arc<HistoryLog>,
        config: Arc<DownloaderConfig>,
        cancel: CancelFlag,
    ) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.rate_limit_rps));
        Self {
            transport,
            store,
            history,
            limiter,
            config,
            cancel,
        }
    }

    fn manager(&self) -> CascadeManager<T> {
        CascadeManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&self.history),
            Arc::clone(&self.limiter),
            Arc::clone(&self.config),
            self.cancel.clone(),
        )
    }

    /// Execute (or, with `dry_run`, only report on) a plan.
    pub async fn run(&self, items: Vec<PlanItem>, dry_run: bool) -> RunSummary {
        let started = std::time::Instant::now();
        let mut summary = RunSummary {
            dry_run,
            ..Default::default()
        };

        // Two plan entries for one destination would put two managers on the
        // same partial file; only the first wins.
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut unique = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.dest_path.clone()) {
                unique.push(item);
            } else {
                warn!(dest = %item.dest_path.display(), "duplicate destination in plan, skipping");
                summary.duplicate_destinations += 1;
            }
        }
        summary.total = unique.len();

        if dry_run {
            for item in &unique {
                let sidecar = self.store.load(&item.dest_path).await.ok().flatten();
                let decision = self.planned_first_strategy(sidecar.as_ref());
                info!(
                    url = %item.resource_url,
                    strategy = decision.map(|k| k.as_str()).unwrap_or("none"),
                    "dry-run decision"
                );
            }
            summary.duration_s = started.elapsed().as_secs_f64();
            return summary;
        }

        let concurrency = self.config.max_concurrency.clamp(1, 2);
        if concurrency <= 1 {
            for item in unique {
                let outcome = self.manager().run(&item).await;
                summary.absorb(&item, outcome);
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut tasks = JoinSet::new();
            for item in unique {
                let permit_source = Arc::clone(&semaphore);
                let manager = self.manager();
                tasks.spawn(async move {
                    let _permit = permit_source.acquire_owned().await;
                    let outcome = manager.run(&item).await;
                    (item, outcome)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((item, outcome)) => summary.absorb(&item, outcome),
                    Err(e) => warn!(error = %e, "download task panicked"),
                }
            }
        }

        summary.duration_s = started.elapsed().as_secs_f64();
        summary
    }

    /// Re-run only the plan items whose destination is missing or empty.
    pub async fn retry_failed(&self, items: Vec<PlanItem>) -> RunSummary {
        let pending: Vec<PlanItem> = items
            .into_iter()
            .filter(|item| {
                std::fs::metadata(&item.dest_path)
                    .map(|meta| meta.len() == 0)
                    .unwrap_or(true)
            })
            .collect();
        if pending.is_empty() {
            info!("no failed downloads to retry");
        }
        self.run(pending, false).await
    }

    /// The strategy the manager would start with, judged from stored state
    /// only. Range support unknown counts as unsupported, so the answer is
    /// conservative until a real probe has run.
    fn planned_first_strategy(
        &self,
        sidecar: Option<&odsync_state::Sidecar>,
    ) -> Option<StrategyKind> {
        let assumed = RemoteInfo {
            content_length: sidecar.and_then(|s| s.content_length),
            accept_ranges: sidecar.and_then(|s| s.accept_ranges).unwrap_or(false),
            ..Default::default()
        };
        self.config
            .strategies
            .iter()
            .copied()
            .find(|kind| kind.is_applicable(&assumed, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockOrigin, MockTransport};
    use odsync_state::PlanReason;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn test_config() -> DownloaderConfig {
        DownloaderConfig {
            rate_limit_rps: 0.0,
            enable_curl: false,
            ..DownloaderConfig::default()
        }
    }

    fn runner(
        origin: &Arc<MockOrigin>,
        state_dir: &std::path::Path,
        config: DownloaderConfig,
    ) -> PlanRunner<MockTransport> {
        PlanRunner::new(
            Arc::new(MockTransport(Arc::clone(origin))),
            Arc::new(SidecarStore::new()),
            Arc::new(HistoryLog::in_state_dir(state_dir)),
            Arc::new(config),
            CancelFlag::new(),
        )
    }

    fn item(dir: &TempDir, name: &str) -> PlanItem {
        PlanItem {
            dataset_slug: "set".into(),
            resource_url: format!("https://origin.example/{name}"),
            dest_path: dir.path().join("data").join(name),
            reason: PlanReason::Missing,
            expected_size: None,
            expected_etag: None,
            resource_name: None,
        }
    }

    #[test]
    fn exit_codes_by_outcome_mix() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.exit_code(), 20, "empty plan is nothing to do");

        summary.total = 3;
        summary.already_complete = 3;
        assert_eq!(summary.exit_code(), 20, "all skipped is nothing to do");

        summary.committed = 2;
        assert_eq!(summary.exit_code(), 0);

        summary.failed = 1;
        assert_eq!(summary.exit_code(), 30);

        summary.committed = 0;
        assert_eq!(summary.exit_code(), 40);

        let dry = RunSummary {
            dry_run: true,
            ..Default::default()
        };
        assert_eq!(dry.exit_code(), 0);
    }

    #[tokio::test]
    async fn dry_run_opens_no_sockets_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let origin = MockOrigin::serving(vec![1, 2, 3], None);
        let runner = runner(&origin, dir.path(), test_config());
        let items = vec![item(&dir, "a.json"), item(&dir, "b.json")];

        let summary = runner.run(items.clone(), true).await;

        assert!(summary.dry_run);
        assert_eq!(summary.total, 2);
        assert_eq!(origin.probes.load(Ordering::SeqCst), 0);
        assert_eq!(origin.gets.load(Ordering::SeqCst), 0);
        assert!(!items[0].dest_path.exists());
        assert!(!items[0].dest_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn run_aggregates_outcomes_and_bytes() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
        let origin = MockOrigin::serving(data.clone(), None);
        let runner = runner(&origin, dir.path(), test_config());

        let summary = runner
            .run(vec![item(&dir, "a.json"), item(&dir, "b.json")], false)
            .await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.bytes, 2 * data.len() as u64);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(
            summary.by_strategy.get("s1_dynamic"),
            Some(&StrategyTally {
                succeeded: 2,
                failed: 0
            })
        );
    }

    #[tokio::test]
    async fn duplicate_destinations_run_once() {
        let dir = TempDir::new().unwrap();
        let origin = MockOrigin::serving(vec![9; 1024], None);
        let runner = runner(&origin, dir.path(), test_config());

        let first = item(&dir, "same.json");
        let second = first.clone();
        let summary = runner.run(vec![first, second], false).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.duplicate_destinations, 1);
        assert_eq!(summary.committed, 1);
    }

    #[tokio::test]
    async fn retry_failed_skips_existing_artifacts() {
        let dir = TempDir::new().unwrap();
        let origin = MockOrigin::serving(vec![7; 2048], None);
        let runner = runner(&origin, dir.path(), test_config());

        let done = item(&dir, "done.json");
        std::fs::create_dir_all(done.dest_path.parent().unwrap()).unwrap();
        std::fs::write(&done.dest_path, b"already here").unwrap();
        let missing = item(&dir, "missing.json");

        let summary = runner.retry_failed(vec![done, missing.clone()]).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.committed, 1);
        assert!(missing.dest_path.exists());
    }
}
