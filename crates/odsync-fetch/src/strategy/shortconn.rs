//! S4: short connections.
//!
//! Same ascending order as S1, but each small chunk rides its own
//! connection (`Connection: close`), defeating servers that grow unstable
//! over a persistent socket.

use crate::net::HttpTransport;
use crate::strategy::writer::{fetch_whole, fill_missing, FillPlan};
use crate::strategy::{StrategyCtx, TransferOutcome};

pub(super) async fn fetch<T: HttpTransport>(ctx: &StrategyCtx<'_, T>) -> TransferOutcome {
    if ctx.remote.accept_ranges && ctx.remote.content_length.is_some() {
        fill_missing(
            ctx,
            FillPlan {
                chunk_bytes: ctx.config.snail_chunk_bytes(),
                overlap: 0,
                close_connection: true,
            },
        )
        .await
    } else {
        fetch_whole(ctx, true).await
    }
}
