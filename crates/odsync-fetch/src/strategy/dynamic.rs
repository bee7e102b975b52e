//! S1: dynamic ranged streaming.
//!
//! Linear download of missing segments in ascending order over keep-alive
//! ranged GETs, with the request size chosen from the file size. On resume
//! the first request starts before the high-water mark and the overlap
//! prefix is discarded. Degrades to a whole-body GET when the server does
//! not support ranges.

use crate::net::HttpTransport;
use crate::strategy::writer::{fetch_whole, fill_missing, FillPlan};
use crate::strategy::{StrategyCtx, TransferOutcome};

pub(super) async fn fetch<T: HttpTransport>(ctx: &StrategyCtx<'_, T>) -> TransferOutcome {
    if ctx.remote.accept_ranges && ctx.remote.content_length.is_some() {
        let chunk_bytes = ctx.config.dynamic_chunk_bytes(ctx.remote.content_length);
        fill_missing(
            ctx,
            FillPlan {
                chunk_bytes,
                overlap: ctx.config.overlap_bytes,
                close_connection: false,
            },
        )
        .await
    } else {
        fetch_whole(ctx, false).await
    }
}
