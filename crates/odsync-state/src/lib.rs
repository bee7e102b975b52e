//! Persistent transfer state for the download core.
//!
//! Everything the engine remembers across process lifetimes lives here: the
//! per-file [`Sidecar`] document with its segment [`SegmentBitmap`], the
//! [`SidecarStore`] that serializes mutations and performs the atomic commit,
//! plan inputs, and the append-only attempt history. There is no database;
//! state is plain files under the destination tree and the state directory.

mod bitmap;
mod error;
mod history;
mod plan;
mod sidecar;
mod store;

pub use bitmap::{SegmentBitmap, SegmentMap};
pub use error::{Result, StateError};
pub use history::{HistoryEntry, HistoryLog};
pub use plan::{read_plan, PlanItem, PlanReason};
pub use sidecar::{partial_path, sidecar_path, utc_timestamp, Sidecar};
pub use store::SidecarStore;
