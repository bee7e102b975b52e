//! Durable filesystem primitives for the sync state tree.
//!
//! Every persistent mutation in the workspace goes through one of two write
//! modalities provided here:
//!
//! - [`atomic_write`]: temp sibling + fsync + rename + directory fsync, for
//!   whole-document replacement (sidecars, plans).
//! - [`append_record`] / [`append_line`]: single-line fsynced appends, for
//!   append-only record files (history, inventory).
//!
//! There are deliberately no in-place rewrites.

mod atomic;
mod error;
mod ndjson;

pub use atomic::{append_line, atomic_write, ensure_dir, fsync_dir};
pub use error::{Error, Result};
pub use ndjson::{append_record, read_records};
