//! S2: sparse segments with bitmap.
//!
//! The file is divided into fixed segments downloaded in a deliberately
//! non-linear order: the first segment, then the last, then the remainder by
//! repeated bisection, mid-first. Each segment rides its own ranged GET and
//! is fsynced before its bit is set. This sidesteps servers that degrade or
//! time out on long sequential reads.

use std::collections::VecDeque;

use crate::error::FetchFailure;
use crate::net::{HttpTransport, RangeSpan, RequestOptions};
use crate::strategy::writer::{next_chunk, open_partial, reset_validator_changed};
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
    let Some(mut segments) = sidecar.segments.clone() else {
        return TransferOutcome::failed(0, FetchFailure::fatal("segments_missing"));
    };
    let known_etag = sidecar.etag.clone();
    let raw_base = sidecar.bytes_written;

    let mut file = match open_partial(dest, Some(len)).await {
        Ok(file) => file,
        Err(e) => return TransferOutcome::failed(0, e),
    };

    let mut marked_bytes = 0u64;
    for index in segment_order(segments.segment_count()) {
        if segments.bitmap.is_marked(index) {
            continue;
        }
        if let Some(reason) = ctx.cancel.check() {
            return TransferOutcome::failed(marked_bytes, reason.into_failure());
        }

        let (start, end) = segments.span(index, len);
        let reply = ctx
            .transport
            .get(
                ctx.url(),
                RangeSpan::Bounded { start, end },
                RequestOptions {
                    close_connection: false,
                    if_range: known_etag.clone(),
                },
            )
            .await;
        let mut reply = match reply {
            Ok(reply) => reply,
            Err(e) => return TransferOutcome::failed(marked_bytes, e),
        };

        if !reply.partial {
            return reset_validator_changed(ctx, marked_bytes).await;
        }
        if let (Some(known), Some(observed)) = (&known_etag, &reply.etag)
            && known != observed
        {
            return reset_validator_changed(ctx, marked_bytes).await;
        }
        if reply.range_start != start {
            return TransferOutcome::failed(marked_bytes, FetchFailure::retryable("range_mismatch"));
        }

        let base = raw_base + marked_bytes;
        match stream_segment(ctx, &mut reply.stream, &mut file, start, end, base).await {
            Ok(()) => {}
            Err(e) => return TransferOutcome::failed(marked_bytes, e),
        }

        if let Err(e) = file.sync_data().await {
            return TransferOutcome::failed(marked_bytes, FetchFailure::io(&e));
        }
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
            return TransferOutcome::failed(marked_bytes, FetchFailure::fatal("sidecar_write"));
        }
        segments.bitmap.mark(index);
        marked_bytes += end - start;
        ctx.progress.record(raw_base + marked_bytes);
    }

    TransferOutcome::done(marked_bytes)
}

async fn stream_segment<T: HttpTransport>(
    ctx: &StrategyCtx<'_, T>,
    stream: &mut crate::net::ByteStream,
    file: &mut tokio::fs::File,
    start: u64,
    end: u64,
    progress_base: u64,
) -> Result<(), FetchFailure> {
    use std::io::SeekFrom;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| FetchFailure::io(&e))?;

    let mut pos = start;
    while pos < end {
        let chunk = match next_chunk(stream, ctx.cancel).await? {
            Some(chunk) => chunk,
            None => return Err(FetchFailure::truncated_body()),
        };
        let take = ((end - pos) as usize).min(chunk.len());
        file.write_all(&chunk[..take])
            .await
            .map_err(|e| FetchFailure::io(&e))?;
        pos += take as u64;
        ctx.progress.record(progress_base + (pos - start));
    }
    Ok(())
}

/// Segment visit order: first, last, then repeated bisection of the
/// interior, mid-first.
fn segment_order(count: usize) -> Vec<usize> {
    match count {
        0 => Vec::new(),
        1 => vec![0],
        2 => vec![0, 1],
        _ => {
            let mut order = vec![0, count - 1];
            let mut intervals = VecDeque::new();
            intervals.push_back((1, count - 2));
            while let Some((lo, hi)) = intervals.pop_front() {
                if lo > hi {
                    continue;
                }
                let mid = lo + (hi - lo) / 2;
                order.push(mid);
                if mid > lo {
                    intervals.push_back((lo, mid - 1));
                }
                if mid < hi {
                    intervals.push_back((mid + 1, hi));
                }
            }
            order
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_starts_with_ends_then_bisects() {
        assert_eq!(segment_order(0), Vec::<usize>::new());
        assert_eq!(segment_order(1), vec![0]);
        assert_eq!(segment_order(2), vec![0, 1]);
        assert_eq!(segment_order(5), vec![0, 4, 2, 1, 3]);
        assert_eq!(segment_order(8), vec![0, 7, 3, 1, 5, 2, 4, 6]);
    }

    #[test]
    fn order_visits_every_segment_once() {
        for count in 0..64 {
            let mut order = segment_order(count);
            order.sort_unstable();
            let expected: Vec<usize> = (0..count).collect();
            assert_eq!(order, expected, "count {count}");
        }
    }
}
