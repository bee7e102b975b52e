//! Strategy cascade manager.
//!
//! Drives one resource through `Idle → Probing → Running(s) → Verifying →
//! Committed | Failed`. The reaction to each attempt is the pure
//! [`decide`] function of the outcome class; the manager adds ordering,
//! backoff, history emission, and the idempotent skip.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use odsync_state::{
    partial_path, utc_timestamp, HistoryEntry, HistoryLog, PlanItem, SegmentMap, Sidecar,
    SidecarStore,
};

use crate::config::DownloaderConfig;
use crate::error::{ErrorClass, FetchFailure};
use crate::net::{HttpTransport, RemoteInfo, TokenBucket};
use crate::stall::{AttemptCancel, CancelFlag, ProgressSink, StallDetector};
use crate::strategy::{self, StrategyCtx, StrategyKind, StrategyReport};
use crate::verify;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const PROBE_RETRIES: u32 = 2;
const MAX_VALIDATOR_RESETS: u32 = 2;

/// Exponential backoff before a retry: `base * 2^retry_count`, capped.
pub(crate) fn retry_delay(retry_count: u32, base: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(retry_count);
    base.saturating_mul(multiplier).min(BACKOFF_CAP)
}

/// What to do after one strategy attempt, as a pure function of its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptDecision {
    Verify,
    RetrySameStrategy,
    AdvanceCascade,
    RestartFromStart,
    Fail,
    Interrupt,
}

pub(crate) fn decide(
    error: Option<ErrorClass>,
    attempts_in_strategy: u32,
    budget: u32,
) -> AttemptDecision {
    match error {
        None => AttemptDecision::Verify,
        Some(ErrorClass::Retryable) if attempts_in_strategy < budget => {
            AttemptDecision::RetrySameStrategy
        }
        Some(ErrorClass::Retryable) => AttemptDecision::AdvanceCascade,
        Some(ErrorClass::Stalled | ErrorClass::Unsupported | ErrorClass::IntegrityFailed) => {
            AttemptDecision::AdvanceCascade
        }
        Some(ErrorClass::ValidatorChanged) => AttemptDecision::RestartFromStart,
        Some(ErrorClass::Fatal) => AttemptDecision::Fail,
        Some(ErrorClass::Interrupted) => AttemptDecision::Interrupt,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Downloaded, verified, and renamed into place this run.
    Committed,
    /// Terminal sidecar already matched the plan; nothing was done.
    AlreadyComplete,
    Failed,
    Interrupted,
}

#[derive(Debug)]
pub struct ItemOutcome {
    pub status: ItemStatus,
    /// Bytes written across all attempts for this item.
    pub bytes: u64,
    /// Strategy that produced the committed artifact, if any.
    pub strategy: Option<StrategyKind>,
    pub error: Option<String>,
}

impl ItemOutcome {
    fn committed(bytes: u64, strategy: StrategyKind) -> Self {
        Self {
            status: ItemStatus::Committed,
            bytes,
            strategy: Some(strategy),
            error: None,
        }
    }

    fn already_complete() -> Self {
        Self {
            status: ItemStatus::AlreadyComplete,
            bytes: 0,
            strategy: None,
            error: None,
        }
    }

    fn failed(bytes: u64, error: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Failed,
            bytes,
            strategy: None,
            error: Some(error.into()),
        }
    }

    fn interrupted(bytes: u64) -> Self {
        Self {
            status: ItemStatus::Interrupted,
            bytes,
            strategy: None,
            error: Some("interrupted".into()),
        }
    }

    fn with_strategy(mut self, strategy: Option<StrategyKind>) -> Self {
        self.strategy = self.strategy.or(strategy);
        self
    }
}

/// Exclusive owner of one resource's transfer for the duration of a run.
pub struct CascadeManager<T: HttpTransport> {
    transport: Arc<T>,
    store: Arc<SidecarStore>,
    history: Arc<HistoryLog>,
    limiter: Arc<TokenBucket>,
    config: Arc<DownloaderConfig>,
    cancel: CancelFlag,
}

impl<T: HttpTransport> CascadeManager<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<SidecarStore>,
        history: Arc<HistoryLog>,
        limiter: Arc<TokenBucket>,
        config: Arc<DownloaderConfig>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            transport,
            store,
            history,
            limiter,
            config,
            cancel,
        }
    }

    pub async fn run(&self, item: &PlanItem) -> ItemOutcome {
        match self.run_inner(item).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(url = %item.resource_url, error = %failure, "download failed");
                ItemOutcome::failed(0, failure.detail)
            }
        }
    }

    async fn run_inner(&self, item: &PlanItem) -> Result<ItemOutcome, FetchFailure> {
        let dest = item.dest_path.as_path();
        if let Some(parent) = dest.parent() {
            odsync_fs::ensure_dir(parent).map_err(|_| FetchFailure::fatal("permission_denied"))?;
        }

        let sidecar = self
            .store
            .load_or_init(dest, || new_sidecar(item))
            .await
            .map_err(state_failure)?;

        // Idempotent skip: terminal sidecar matching the plan means zero
        // network I/O and zero writes.
        if sidecar.is_terminal()
            && dest.exists()
            && sidecar.matches_expectations(item.expected_etag.as_deref(), item.expected_size)
        {
            debug!(url = %item.resource_url, "already complete, skipping");
            return Ok(ItemOutcome::already_complete());
        }

        // Crash-window recovery: the final file exists but the sidecar never
        // became terminal. Re-verify locally and finalize, or discard.
        if dest.exists() && !sidecar.is_terminal() {
            match verify::verify_file(dest, &sidecar).await {
                Ok(sha) => {
                    let strategy = sidecar.strategy.clone();
                    self.store
                        .finalize_existing(dest, &sha, strategy.as_deref().unwrap_or("s1_dynamic"))
                        .await
                        .map_err(state_failure)?;
                    info!(url = %item.resource_url, "finalized existing artifact");
                    return Ok(ItemOutcome {
                        status: ItemStatus::Committed,
                        bytes: 0,
                        strategy: None,
                        error: None,
                    });
                }
                Err(_) => {
                    let _ = self.store.reset_corrupted(dest).await;
                }
            }
        }

        let mut remote = self.probe(&item.resource_url).await?;
        self.absorb_probe(item, &remote).await?;

        let base_order: Vec<StrategyKind> = self
            .config
            .strategies
            .iter()
            .copied()
            .filter(|kind| kind.is_applicable(&remote, &self.config))
            .collect();
        if base_order.is_empty() {
            return Ok(ItemOutcome::failed(0, "no_applicable_strategy"));
        }

        let mut stalled: HashSet<StrategyKind> = HashSet::new();
        let mut validator_resets = 0u32;
        let mut integrity_restarted = false;
        let mut start_at = 0usize;
        let mut total_bytes = 0u64;
        let mut last_error: Option<FetchFailure> = None;
        let mut last_kind: Option<StrategyKind> = None;

        'cascade: loop {
            // Strategies that stalled earlier go last: they are reattempted
            // only once everything else has been tried.
            let tail = &base_order[start_at..];
            let mut pass: Vec<StrategyKind> = tail
                .iter()
                .copied()
                .filter(|kind| !stalled.contains(kind))
                .collect();
            pass.extend(tail.iter().copied().filter(|kind| stalled.contains(kind)));

            for kind in pass {
                let mut attempts = 0u32;
                loop {
                    if self.cancel.is_cancelled() {
                        return Ok(ItemOutcome::interrupted(total_bytes).with_strategy(last_kind));
                    }
                    attempts += 1;
                    last_kind = Some(kind);

                    let (report, entry) = self.attempt(kind, item, &remote).await;
                    total_bytes += report.bytes_written;
                    if let Err(e) = self.history.append(&entry) {
                        warn!(error = %e, "failed to append history record");
                    }

                    let class = report.error.as_ref().map(|f| f.class);
                    match decide(class, attempts, self.config.retries_per_strategy) {
                        AttemptDecision::Verify => {
                            let sidecar = self
                                .store
                                .load(dest)
                                .await
                                .map_err(state_failure)?
                                .unwrap_or_else(|| new_sidecar(item));
                            match verify::verify_partial(dest, &sidecar).await {
                                Ok(sha) => {
                                    self.store
                                        .commit(dest, &sha, kind.as_str())
                                        .await
                                        .map_err(state_failure)?;
                                    info!(
                                        url = %item.resource_url,
                                        strategy = %kind,
                                        bytes = total_bytes,
                                        "committed"
                                    );
                                    return Ok(ItemOutcome::committed(total_bytes, kind));
                                }
                                Err(f) if f.class == ErrorClass::IntegrityFailed => {
                                    warn!(
                                        url = %item.resource_url,
                                        error = %f,
                                        "integrity check failed, restarting conservatively"
                                    );
                                    let _ = self.store.reset_corrupted(dest).await;
                                    if integrity_restarted {
                                        return Ok(ItemOutcome::failed(total_bytes, f.detail)
                                            .with_strategy(Some(kind)));
                                    }
                                    integrity_restarted = true;
                                    start_at = base_order
                                        .iter()
                                        .position(|k| *k == StrategyKind::S4Shortconn)
                                        .unwrap_or(0);
                                    continue 'cascade;
                                }
                                Err(f) => {
                                    last_error = Some(f);
                                    break;
                                }
                            }
                        }
                        AttemptDecision::RetrySameStrategy => {
                            last_error = report.error;
                            tokio::time::sleep(retry_delay(attempts - 1, BACKOFF_BASE)).await;
                        }
                        AttemptDecision::AdvanceCascade => {
                            if class == Some(ErrorClass::Stalled) {
                                // A stall already burned the threshold; move on now.
                                stalled.insert(kind);
                            } else if class == Some(ErrorClass::Retryable) {
                                tokio::time::sleep(BACKOFF_BASE).await;
                            }
                            last_error = report.error;
                            break;
                        }
                        AttemptDecision::RestartFromStart => {
                            validator_resets += 1;
                            if validator_resets > MAX_VALIDATOR_RESETS {
                                return Ok(ItemOutcome::failed(total_bytes, "validator_changed")
                                    .with_strategy(Some(kind)));
                            }
                            warn!(url = %item.resource_url, "validator changed, restarting cascade");
                            remote = self.probe(&item.resource_url).await?;
                            self.absorb_probe(item, &remote).await?;
                            start_at = 0;
                            continue 'cascade;
                        }
                        AttemptDecision::Fail => {
                            let failure = report
                                .error
                                .unwrap_or_else(|| FetchFailure::fatal("unknown"));
                            return Ok(ItemOutcome::failed(total_bytes, failure.detail)
                                .with_strategy(Some(kind)));
                        }
                        AttemptDecision::Interrupt => {
                            return Ok(
                                ItemOutcome::interrupted(total_bytes).with_strategy(Some(kind))
                            );
                        }
                    }
                }
            }

            let detail = last_error
                .as_ref()
                .map(|f| f.detail.clone())
                .unwrap_or_else(|| "exhausted".into());
            return Ok(ItemOutcome::failed(total_bytes, detail).with_strategy(last_kind));
        }
    }

    /// One strategy attempt under a fresh stall watchdog, plus its history
    /// record. `retries` counts every invocation, per attempt.
    async fn attempt(
        &self,
        kind: StrategyKind,
        item: &PlanItem,
        remote: &RemoteInfo,
    ) -> (StrategyReport, HistoryEntry) {
        let dest = item.dest_path.as_path();
        let bytes_before = self
            .store
            .update(dest, |s| {
                s.retries += 1;
                s.strategy = Some(kind.as_str().to_string());
            })
            .await
            .map(|s| s.bytes_written)
            .unwrap_or(0);

        let start = utc_timestamp();
        let started = std::time::Instant::now();
        let sink = Arc::new(ProgressSink::new(bytes_before));
        let cancel = AttemptCancel::new(self.cancel.clone());
        let _watchdog = StallDetector::spawn(
            Arc::clone(&sink),
            cancel.clone(),
            self.config.stall_threshold(),
        );

        let ctx = StrategyCtx {
            transport: self.transport.as_ref(),
            config: &self.config,
            store: &self.store,
            item,
            remote,
            cancel: &cancel,
            progress: sink.as_ref(),
        };
        let report = strategy::run(kind, &ctx).await;

        debug!(
            url = %item.resource_url,
            strategy = %kind,
            ok = report.ok,
            bytes = report.bytes_written,
            error = report.error.as_ref().map(|f| f.detail.as_str()),
            "attempt finished"
        );

        let entry = HistoryEntry {
            resource_url: item.resource_url.clone(),
            strategy: kind.as_str().to_string(),
            start,
            end: utc_timestamp(),
            bytes: report.bytes_written,
            ok: report.ok,
            error: report.error.as_ref().map(|f| f.detail.clone()),
            dest_path: item.dest_path.clone(),
            duration_s: started.elapsed().as_secs_f64(),
        };
        (report, entry)
    }

    /// Paced probe with a small retry budget for transient failures.
    async fn probe(&self, url: &str) -> Result<RemoteInfo, FetchFailure> {
        let mut attempt = 0u32;
        loop {
            self.limiter.pace_probe().await;
            match self.transport.probe(url).await {
                Ok(info) => return Ok(info),
                Err(f) if f.class == ErrorClass::Retryable && attempt < PROBE_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(retry_delay(attempt - 1, BACKOFF_BASE)).await;
                }
                Err(f) => return Err(f),
            }
        }
    }

    /// Fold probe results into the sidecar and initialize segment geometry.
    ///
    /// A validator change relative to stored state voids any partial
    /// progress before strategies get to run against the new content.
    async fn absorb_probe(&self, item: &PlanItem, remote: &RemoteInfo) -> Result<(), FetchFailure> {
        let dest = item.dest_path.as_path();
        let sidecar = self
            .store
            .load(dest)
            .await
            .map_err(state_failure)?
            .unwrap_or_else(|| new_sidecar(item));

        // Redirects are followed by the transport; the resource identity we
        // store stays the plan URL.
        if let Some(final_url) = &remote.final_url
            && *final_url != item.resource_url
        {
            debug!(url = %item.resource_url, resolved = %final_url, "probe followed redirects");
        }

        let had_progress = sidecar.bytes_written > 0 || partial_path(dest).exists();
        if had_progress
            && let (Some(known), Some(observed)) = (&sidecar.etag, &remote.etag)
            && known != observed
        {
            warn!(url = %item.resource_url, "resource changed since last run, discarding partial");
            self.store
                .reset_partial(dest, "validator_changed")
                .await
                .map_err(state_failure)?;
        }

        let segment_size = sidecar
            .segments
            .as_ref()
            .map(|map| map.size)
            .unwrap_or_else(|| self.config.segment_bytes());

        self.store
            .update(dest, |s| {
                if remote.etag.is_some() {
                    s.etag = remote.etag.clone();
                }
                if remote.last_modified.is_some() {
                    s.last_modified = remote.last_modified.clone();
                }
                s.accept_ranges = Some(remote.accept_ranges);
                if let Some(len) = remote.content_length {
                    s.content_length = Some(len);
                    let expected_count = len.div_ceil(segment_size.max(1)) as usize;
                    let needs_init = s
                        .segments
                        .as_ref()
                        .map(|map| map.bitmap.len() != expected_count)
                        .unwrap_or(true);
                    if needs_init {
                        s.segments = Some(SegmentMap::for_length(len, segment_size));
                        s.recompute_bytes_written();
                    }
                }
            })
            .await
            .map_err(state_failure)?;
        Ok(())
    }
}

fn new_sidecar(item: &PlanItem) -> Sidecar {
    let mut sidecar = Sidecar::new(&item.resource_url, &item.dataset_slug);
    sidecar.resource_name = item.resource_name.clone();
    sidecar.etag = item.expected_etag.clone();
    sidecar.content_length = item.expected_size;
    sidecar
}

fn state_failure(err: odsync_state::StateError) -> FetchFailure {
    FetchFailure::fatal(format!("state:{err}"))
}
