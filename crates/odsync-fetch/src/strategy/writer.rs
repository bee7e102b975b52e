//! Shared transfer plumbing for the range-based strategies.
//!
//! [`fill_missing`] downloads unmarked segments in ascending order, grouping
//! consecutive misses into ranged requests; [`fetch_whole`] streams a full
//! body for servers without range support. Both fsync before marking a
//! segment, checkpoint through the sidecar store, and poll cancellation at
//! every chunk.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use odsync_state::partial_path;

use crate::error::FetchFailure;
use crate::net::{ByteStream, HttpTransport, RangeSpan, RequestOptions};
use crate::stall::AttemptCancel;
use crate::strategy::{StrategyCtx, TransferOutcome};

/// How a ranged fill should drive its requests.
pub(crate) struct FillPlan {
    /// Target request size in bytes; rounded down to whole segments.
    pub chunk_bytes: u64,
    /// Bytes to re-request before the first missing offset on resume. The
    /// overlap prefix is discarded, tolerating a last block lost pre-fsync.
    pub overlap: u64,
    /// Send `Connection: close` on every request.
    pub close_connection: bool,
}

/// Open (or create) the partial file, sizing it for sparse writes.
pub(crate) async fn open_partial(dest: &Path, len: Option<u64>) -> Result<File, FetchFailure> {
    let part = partial_path(dest);
    if let Some(parent) = part.parent() {
        odsync_fs::ensure_dir(parent).map_err(|_| FetchFailure::fatal("permission_denied"))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&part)
        .await
        .map_err(|e| FetchFailure::io(&e))?;

    if let Some(len) = len {
        let current = file.metadata().await.map_err(|e| FetchFailure::io(&e))?.len();
        if current != len {
            file.set_len(len).await.map_err(|e| FetchFailure::io(&e))?;
        }
    }
    Ok(file)
}

/// Pull the next chunk, polling cancellation while the read is pending.
///
/// This is the strategy's read suspension point: a stall trip or process
/// interruption surfaces here instead of blocking on a dead socket.
pub(crate) async fn next_chunk(
    stream: &mut ByteStream,
    cancel: &AttemptCancel,
) -> Result<Option<Bytes>, FetchFailure> {
    loop {
        tokio::select! {
            chunk = stream.next() => {
                return match chunk {
                    None => Ok(None),
                    Some(Ok(bytes)) => Ok(Some(bytes)),
                    Some(Err(e)) => Err(e),
                };
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if let Some(reason) = cancel.check() {
                    return Err(reason.into_failure());
                }
            }
        }
    }
}

/// Download every unmarked segment in ascending order.
///
/// Requires a known `content_length` and an initialized segment map in the
/// sidecar (the cascade manager guarantees both).
pub(crate) async fn fill_missing<T: HttpTransport>(
    ctx: &StrategyCtx<'_, T>,
    plan: FillPlan,
) -> TransferOutcome {
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

    let mut file = match open_partial(dest, Some(len)).await {
        Ok(file) => file,
        Err(e) => return TransferOutcome::failed(0, e),
    };

    let chunk_segments = ((plan.chunk_bytes / segments.size).max(1)) as usize;
    let mut marked_bytes = 0u64;
    let mut raw_written = 0u64;
    let raw_base = sidecar.bytes_written;
    let mut first_request = sidecar.bytes_written > 0;

    loop {
        if let Some(reason) = ctx.cancel.check() {
            return TransferOutcome::failed(marked_bytes, reason.into_failure());
        }
        let Some(first) = segments.bitmap.first_missing() else {
            break;
        };

        let mut run_len = 1;
        while run_len < chunk_segments
            && first + run_len < segments.segment_count()
            && !segments.bitmap.is_marked(first + run_len)
        {
            run_len += 1;
        }
        let (run_start, _) = segments.span(first, len);
        let (_, run_end) = segments.span(first + run_len - 1, len);

        let overlap = if first_request {
            plan.overlap.min(run_start)
        } else {
            0
        };
        first_request = false;
        let req_start = run_start - overlap;

        let reply = ctx
            .transport
            .get(
                ctx.url(),
                RangeSpan::Bounded {
                    start: req_start,
                    end: run_end,
                },
                RequestOptions {
                    close_connection: plan.close_connection,
                    if_range: known_etag.clone(),
                },
            )
            .await;
        let mut reply = match reply {
            Ok(reply) => reply,
            Err(e) => return TransferOutcome::failed(marked_bytes, e),
        };

        if etag_conflicts(known_etag.as_deref(), reply.etag.as_deref()) {
            return reset_validator_changed(ctx, marked_bytes).await;
        }

        if !reply.partial {
            // A full-body answer to a range request: with prior progress this
            // invalidates the resume; with none it simply is the content.
            if req_start != 0 || segments.bitmap.marked_count() > 0 {
                return reset_validator_changed(ctx, marked_bytes).await;
            }
        } else if reply.range_start > req_start {
            return TransferOutcome::failed(marked_bytes, FetchFailure::retryable("range_mismatch"));
        }

        let reply_start = if reply.partial { reply.range_start } else { 0 };
        let mut discard = run_start - reply_start;
        let mut pos = run_start;
        let mut next_to_mark = first;
        // A full-body reply keeps streaming past our requested run.
        let target_end = if reply.partial { run_end } else { len };
        let mark_limit = if reply.partial {
            first + run_len
        } else {
            segments.segment_count()
        };

        while pos < target_end {
            let chunk = match next_chunk(&mut reply.stream, ctx.cancel).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return TransferOutcome::failed(marked_bytes, e),
            };

            let mut data = &chunk[..];
            if discard > 0 {
                let skip = (discard as usize).min(data.len());
                data = &data[skip..];
                discard -= skip as u64;
                if data.is_empty() {
                    continue;
                }
            }
            let take = ((target_end - pos) as usize).min(data.len());

            if let Err(e) = write_at(&mut file, pos, &data[..take]).await {
                return TransferOutcome::failed(marked_bytes, e);
            }
            pos += take as u64;
            raw_written += take as u64;
            ctx.progress.record(raw_base + raw_written);

            while next_to_mark < mark_limit {
                let (seg_start, seg_end) = segments.span(next_to_mark, len);
                if pos < seg_end {
                    break;
                }
                if let Err(e) = file.sync_data().await {
                    return TransferOutcome::failed(marked_bytes, FetchFailure::io(&e));
                }
                let index = next_to_mark;
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
                marked_bytes += seg_end - seg_start;
                next_to_mark += 1;
            }
        }

        if pos < target_end {
            return TransferOutcome::failed(marked_bytes, FetchFailure::truncated_body());
        }
    }

    TransferOutcome::done(marked_bytes)
}

/// Stream a whole body into the partial file, for servers without usable
/// ranges or without a known length. Restarts from zero on every attempt.
pub(crate) async fn fetch_whole<T: HttpTransport>(
    ctx: &StrategyCtx<'_, T>,
    close_connection: bool,
) -> TransferOutcome {
    let dest = &ctx.item.dest_path;

    let reply = ctx
        .transport
        .get(
            ctx.url(),
            RangeSpan::Whole,
            RequestOptions {
                close_connection,
                if_range: None,
            },
        )
        .await;
    let mut reply = match reply {
        Ok(reply) => reply,
        Err(e) => return TransferOutcome::failed(0, e),
    };
    let expected = reply.total_length;

    let mut file = match open_partial(dest, None).await {
        Ok(file) => file,
        Err(e) => return TransferOutcome::failed(0, e),
    };
    if let Err(e) = file.set_len(0).await {
        return TransferOutcome::failed(0, FetchFailure::io(&e));
    }

    let mut written = 0u64;
    let mut last_checkpoint = 0u64;
    loop {
        let chunk = match next_chunk(&mut reply.stream, ctx.cancel).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return TransferOutcome::failed(written, e),
        };
        if let Err(e) = write_at(&mut file, written, &chunk).await {
            return TransferOutcome::failed(written, e);
        }
        written += chunk.len() as u64;
        ctx.progress.record(written);

        if written - last_checkpoint >= CHECKPOINT_EVERY {
            last_checkpoint = written;
            let _ = checkpoint_whole(ctx, written, false).await;
        }
    }

    if let Err(e) = file.sync_data().await {
        return TransferOutcome::failed(written, FetchFailure::io(&e));
    }
    if let Some(expected) = expected
        && written != expected
    {
        return TransferOutcome::failed(written, FetchFailure::truncated_body());
    }

    match checkpoint_whole(ctx, written, true).await {
        Ok(()) => TransferOutcome::done(written),
        Err(e) => TransferOutcome::failed(written, e),
    }
}

const CHECKPOINT_EVERY: u64 = 4 * 1024 * 1024;

async fn checkpoint_whole<T: HttpTransport>(
    ctx: &StrategyCtx<'_, T>,
    written: u64,
    finished: bool,
) -> Result<(), FetchFailure> {
    ctx.store
        .update(&ctx.item.dest_path, |s| {
            if finished {
                s.bytes_written = written;
                if s.content_length.is_none() {
                    // No Content-Length from the origin; record the observed size.
                    s.content_length = Some(written);
                }
            } else {
                s.bytes_written = s.bytes_written.max(written);
            }
        })
        .await
        .map(|_| ())
        .map_err(|_| FetchFailure::fatal("sidecar_write"))
}

async fn write_at(file: &mut File, pos: u64, data: &[u8]) -> Result<(), FetchFailure> {
    file.seek(SeekFrom::Start(pos))
        .await
        .map_err(|e| FetchFailure::io(&e))?;
    file.write_all(data).await.map_err(|e| FetchFailure::io(&e))
}

fn etag_conflicts(known: Option<&str>, observed: Option<&str>) -> bool {
    match (known, observed) {
        (Some(known), Some(observed)) => known != observed,
        _ => false,
    }
}

/// Discard all partial progress and report `validator_changed`; the cascade
/// restarts from the first strategy with a clean slate.
pub(crate) async fn reset_validator_changed<T: HttpTransport>(
    ctx: &StrategyCtx<'_, T>,
    bytes_so_far: u64,
) -> TransferOutcome {
    let _ = ctx
        .store
        .reset_partial(&ctx.item.dest_path, "validator_changed")
        .await;
    TransferOutcome::failed(bytes_so_far, FetchFailure::validator_changed())
}
