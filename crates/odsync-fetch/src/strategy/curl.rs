//! S3: external curl.
//!
//! Delegates the transfer to `curl` with native resume against the partial
//! file. Skipped when the tool is disabled or absent. The exit code and
//! reported HTTP status are mapped into the shared error taxonomy.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::FetchFailure;
use crate::net::HttpTransport;
use crate::strategy::{StrategyCtx, TransferOutcome};

pub(super) async fn fetch<T: HttpTransport>(ctx: &StrategyCtx<'_, T>) -> TransferOutcome {
    if !ctx.config.enable_curl {
        return TransferOutcome::failed(0, FetchFailure::unsupported("curl_disabled"));
    }

    let dest = &ctx.item.dest_path;
    let part = odsync_state::partial_path(dest);
    if let Some(parent) = part.parent()
        && odsync_fs::ensure_dir(parent).is_err()
    {
        return TransferOutcome::failed(0, FetchFailure::fatal("permission_denied"));
    }
    let bytes_before = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);

    let mut child = match Command::new(&ctx.config.curl_path)
        .arg("--location")
        .arg("--silent")
        .arg("--show-error")
        .arg("--retry")
        .arg(ctx.config.retries_per_strategy.to_string())
        .arg("--retry-delay")
        .arg("5")
        .arg("--limit-rate")
        .arg("200k")
        .arg("--continue-at")
        .arg("-")
        .arg("--output")
        .arg(&part)
        .arg("--write-out")
        .arg("%{http_code}")
        .arg(ctx.url())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return TransferOutcome::failed(0, FetchFailure::unsupported("curl_missing"));
        }
        Err(e) => return TransferOutcome::failed(0, FetchFailure::io(&e)),
    };

    // Poll the child so cancellation can reap it; curl has no cooperative
    // chunk boundary we can hook.
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(reason) = ctx.cancel.check() {
                    let _ = child.kill().await;
                    return TransferOutcome::failed(0, reason.into_failure());
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                let written = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
                ctx.progress.record(written);
            }
            Err(e) => return TransferOutcome::failed(0, FetchFailure::io(&e)),
        }
    };

    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => return TransferOutcome::failed(0, FetchFailure::io(&e)),
    };

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        return TransferOutcome::failed(0, map_curl_exit(code));
    }

    if let Ok(stdout) = String::from_utf8(output.stdout)
        && let Ok(http_code) = stdout.trim().parse::<u16>()
        && !matches!(http_code, 200 | 206)
    {
        return TransferOutcome::failed(0, FetchFailure::http_status(http_code));
    }

    let part_len = match tokio::fs::metadata(&part).await {
        Ok(meta) => meta.len(),
        Err(e) => return TransferOutcome::failed(0, FetchFailure::io(&e)),
    };
    if let Some(expected) = ctx.remote.content_length
        && part_len != expected
    {
        return TransferOutcome::failed(
            part_len.saturating_sub(bytes_before),
            FetchFailure::truncated_body(),
        );
    }

    // curl wrote a contiguous file; the whole bitmap is now covered.
    let update = ctx
        .store
        .update(dest, |s| {
            if let Some(map) = s.segments.as_mut() {
                map.bitmap.mark_all();
            }
            if s.content_length.is_none() {
                s.content_length = Some(part_len);
            }
            s.bytes_written = part_len;
        })
        .await;
    if update.is_err() {
        return TransferOutcome::failed(0, FetchFailure::fatal("sidecar_write"));
    }

    ctx.progress.record(part_len);
    TransferOutcome::done(part_len.saturating_sub(bytes_before))
}

/// Map a curl exit code into the taxonomy.
fn map_curl_exit(code: i32) -> FetchFailure {
    match code {
        6 => FetchFailure::dns(),
        7 => FetchFailure::retryable("connect"),
        18 => FetchFailure::truncated_body(),
        22 => FetchFailure::unsupported("curl_http_error"),
        23 => FetchFailure::fatal("disk_full"),
        28 => FetchFailure::timeout(),
        33 => FetchFailure::unsupported("http_416"),
        35 | 52 | 55 | 56 => FetchFailure::connection_reset(),
        other => FetchFailure::retryable(format!("curl_exit:{other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn curl_exit_codes_map_to_classes() {
        assert_eq!(map_curl_exit(6).class, ErrorClass::Fatal);
        assert_eq!(map_curl_exit(7).class, ErrorClass::Retryable);
        assert_eq!(map_curl_exit(18).detail, "truncated_body");
        assert_eq!(map_curl_exit(28).detail, "timeout");
        assert_eq!(map_curl_exit(33).class, ErrorClass::Unsupported);
        assert_eq!(map_curl_exit(99).detail, "curl_exit:99");
    }
}
