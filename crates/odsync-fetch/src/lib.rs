//! Resumable multi-strategy download engine.
//!
//! The engine mirrors remote artifacts onto the local filesystem while
//! tolerating server misbehavior: missing range support, mid-stream stalls,
//! truncated bodies, and validators that change under the transfer. Five
//! tactics share one resume protocol built on a per-file sidecar document
//! and a segment bitmap; a cascade manager walks them in configured order
//! until the artifact verifies and commits atomically.
//!
//! # Architecture
//!
//! - [`net`]: the [`HttpTransport`] seam, its `reqwest` implementation, and
//!   the process-global request pacer.
//! - [`strategy`]: the closed set of transfer tactics and their shared
//!   range/chunk plumbing.
//! - [`stall`]: progress observation and cooperative cancellation.
//! - [`cascade`]: the per-resource state machine (probe → run → verify →
//!   commit) and history emission.
//! - [`runner`]: plan iteration, bounded parallelism, and the run summary.
//!
//! Shared resources (transport, rate limiter, sidecar store, history log)
//! are passed explicitly into constructors; nothing here is a process-wide
//! singleton.

mod cascade;
mod config;
mod error;
mod net;
mod runner;
mod stall;
mod strategy;
#[cfg(test)]
mod testing;
mod verify;

pub use cascade::{CascadeManager, ItemOutcome, ItemStatus};
pub use config::{DownloaderConfig, HttpConfig};
pub use error::{ErrorClass, FetchFailure};
pub use net::{
    ByteStream, HttpTransport, RangeReply, RangeSpan, RemoteInfo, RequestOptions, TokenBucket,
};
#[cfg(feature = "reqwest")]
pub use net::ReqwestTransport;
pub use runner::{PlanRunner, RunSummary, StrategyTally};
pub use stall::{AttemptCancel, CancelFlag, CancelReason, ProgressSink, StallDetector};
pub use strategy::{StrategyCtx, StrategyKind, StrategyReport};
