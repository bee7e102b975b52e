//! S5: tail-first.
//!
//! Fetches the final segment with a suffix range first, checking that the
//! server still advertises a consistent total length, then fills the
//! remainder in ascending order. A last resort that surfaces truncation and
//! stability pathologies before committing effort to a large transfer.

use std::io::SeekFrom;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::FetchFailure;
use crate::net::{HttpTransport, RangeSpan, RequestOptions};
use crate::strategy::writer::{
    fill_missing, next_chunk, open_partial, reset_validator_changed, FillPlan,
};
use crate::strategy::{StrategyCtx, TransferOutcome};

pub(super) async fn fetch<T: HttpTransport>(ctx: &StrategyCtx<'_, T>) -> TransferOutcome {
    let dest = &ctx.item.dest_path;
    let Some(len) = ctx.remote.content_length else {
        return TransferOutcome::failed(0, FetchFailure::unsupported("length_unknown"));
    };

    let sidecar = match ctx.store.load(dest).await {
        Ok(Some(sidecar)) => sidecar,
        _ => return TransferOutcome::failed(0, FetchFailure::fatal("sidecar_missing")),
    };
    let Some(segments) = sidecar.segments.clone() else {
        return TransferOutcome::failed(0, FetchFailure::fatal("segments_missing"));
    };

    let mut tail_bytes = 0u64;
    let count = segments.segment_count();
    if count > 0 && !segments.bitmap.is_marked(count - 1) {
        let (tail_start, tail_end) = segments.span(count - 1, len);
        let tail_len = tail_end - tail_start;

        let reply = ctx
            .transport
            .get(
                ctx.url(),
                RangeSpan::Suffix(tail_len),
                RequestOptions {
                    close_connection: false,
                    if_range: sidecar.etag.clone(),
                },
            )
            .await;
        let mut reply = match reply {
            Ok(reply) => reply,
            Err(e) => return TransferOutcome::failed(0, e),
        };

        if !reply.partial {
            return reset_validator_changed(ctx, 0).await;
        }
        // The tail probe exists to catch a server whose advertised length
        // drifts between requests.
        match reply.total_length {
            Some(total) if total == len => {}
            _ => return TransferOutcome::failed(0, FetchFailure::retryable("length_mismatch")),
        }
        if reply.range_start != tail_start {
            return TransferOutcome::failed(0, FetchFailure::retryable("range_mismatch"));
        }

        let mut file = match open_partial(dest, Some(len)).await {
            Ok(file) => file,
            Err(e) => return TransferOutcome::failed(0, e),
        };

        let mut pos = tail_start;
        while pos < tail_end {
            let chunk = match next_chunk(&mut reply.stream, ctx.cancel).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return TransferOutcome::failed(0, FetchFailure::truncated_body()),
                Err(e) => return TransferOutcome::failed(0, e),
            };
            let take = ((tail_end - pos) as usize).min(chunk.len());
            if let Err(e) = file.seek(SeekFrom::Start(pos)).await {
                return TransferOutcome::failed(0, FetchFailure::io(&e));
            }
            if let Err(e) = file.write_all(&chunk[..take]).await {
                return TransferOutcome::failed(0, FetchFailure::io(&e));
            }
            pos += take as u64;
            ctx.progress.record(sidecar.bytes_written + (pos - tail_start));
        }

        if let Err(e) = file.sync_data().await {
            return TransferOutcome::failed(0, FetchFailure::io(&e));
        }
        let index = count - 1;
        let update = ctx
            .store
            .update(dest, |s| {
                if let Some(map) = s.segments.as_mut() {
                    map.bitmap.mark(index);
                }
                s.recompute_bytes_written();
            })
            .await;
        if update.is_err() {
            return TransferOutcome::failed(0, FetchFailure::fatal("sidecar_write"));
        }
        tail_bytes = tail_len;
        ctx.progress.record(sidecar.bytes_written + tail_bytes);
    }

    // Ascending fill over everything before the tail.
    let rest = fill_missing(
        ctx,
        FillPlan {
            chunk_bytes: ctx.config.dynamic_chunk_bytes(Some(len)),
            overlap: 0,
            close_connection: false,
        },
    )
    .await;

    TransferOutcome {
        bytes_marked: tail_bytes + rest.bytes_marked,
        error: rest.error,
    }
}
