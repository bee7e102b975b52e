//! Transfer strategies.
//!
//! The five tactics form a closed set sharing one contract: a strategy writes
//! only the partial file, checkpoints the sidecar at least once per completed
//! segment, pushes progress into the attempt's sink, polls cancellation at
//! chunk boundaries, and reports errors by class instead of raising them.
//! Adding a sixth tactic means extending [`StrategyKind`] and the
//! configurable order.

mod curl;
mod dynamic;
mod shortconn;
mod sparse;
mod tailfirst;
pub(crate) mod writer;

use std::fmt;

use serde::{Deserialize, Serialize};

use odsync_state::{PlanItem, SidecarStore};

use crate::config::DownloaderConfig;
use crate::error::FetchFailure;
use crate::net::{HttpTransport, RemoteInfo};
use crate::stall::{AttemptCancel, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Linear ranged streaming with size-adaptive chunks.
    S1Dynamic,
    /// Fixed segments fetched in a non-linear order, tracked by bitmap.
    S2Sparse,
    /// External curl with native resume.
    S3Curl,
    /// Small chunks over one connection each.
    S4Shortconn,
    /// Final segment first, then ascending fill.
    S5Tailfirst,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::S1Dynamic => "s1_dynamic",
            StrategyKind::S2Sparse => "s2_sparse",
            StrategyKind::S3Curl => "s3_curl",
            StrategyKind::S4Shortconn => "s4_shortconn",
            StrategyKind::S5Tailfirst => "s5_tailfirst",
        }
    }

    /// Whether the tactic can run at all against what the probe learned.
    ///
    /// S2 and S5 need ranges and a known length; S3 needs the external tool
    /// enabled; S1 and S4 always apply (they degrade to a whole-body GET
    /// when ranges are unsupported).
    pub fn is_applicable(&self, remote: &RemoteInfo, config: &DownloaderConfig) -> bool {
        match self {
            StrategyKind::S1Dynamic | StrategyKind::S4Shortconn => true,
            StrategyKind::S2Sparse | StrategyKind::S5Tailfirst => {
                remote.accept_ranges && remote.content_length.is_some()
            }
            StrategyKind::S3Curl => config.enable_curl,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a strategy attempt needs, passed explicitly; strategies own no
/// shared state.
pub struct StrategyCtx<'a, T: HttpTransport> {
    pub transport: &'a T,
    pub config: &'a DownloaderConfig,
    pub store: &'a SidecarStore,
    pub item: &'a PlanItem,
    pub remote: &'a RemoteInfo,
    pub cancel: &'a AttemptCancel,
    pub progress: &'a ProgressSink,
}

impl<T: HttpTransport> StrategyCtx<'_, T> {
    pub fn url(&self) -> &str {
        &self.item.resource_url
    }
}

/// What one strategy attempt did.
#[derive(Debug)]
pub struct StrategyReport {
    pub ok: bool,
    /// Bytes newly covered by this attempt (the `bytes_written` delta).
    pub bytes_written: u64,
    pub strategy: StrategyKind,
    pub etag: Option<String>,
    pub error: Option<FetchFailure>,
}

/// Internal result of a transfer routine: bytes it managed to cover plus the
/// failure that stopped it, if any.
#[derive(Debug, Default)]
pub(crate) struct TransferOutcome {
    pub bytes_marked: u64,
    pub error: Option<FetchFailure>,
}

impl TransferOutcome {
    pub(crate) fn done(bytes_marked: u64) -> Self {
        Self {
            bytes_marked,
            error: None,
        }
    }

    pub(crate) fn failed(bytes_marked: u64, error: FetchFailure) -> Self {
        Self {
            bytes_marked,
            error: Some(error),
        }
    }
}

/// Run one attempt of the given strategy.
pub async fn run<T: HttpTransport>(
    kind: StrategyKind,
    ctx: &StrategyCtx<'_, T>,
) -> StrategyReport {
    let outcome = match kind {
        StrategyKind::S1Dynamic => dynamic::fetch(ctx).await,
        StrategyKind::S2Sparse => sparse::fetch(ctx).await,
        StrategyKind::S3Curl => curl::fetch(ctx).await,
        StrategyKind::S4Shortconn => shortconn::fetch(ctx).await,
        StrategyKind::S5Tailfirst => tailfirst::fetch(ctx).await,
    };

    StrategyReport {
        ok: outcome.error.is_none(),
        bytes_written: outcome.bytes_marked,
        strategy: kind,
        etag: ctx.remote.etag.clone(),
        error: outcome.error,
    }
}
