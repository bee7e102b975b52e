use tracing::{info, warn};

use odsync_fetch::RunSummary;

const ERROR_LISTING_CAP: usize = 10;

pub fn format_bytes(count: u64) -> String {
    let mut value = count as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

/// Log the run summary: totals, per-strategy tallies, and the first few
/// errors.
pub fn log_summary(summary: &RunSummary) {
    if summary.dry_run {
        info!(total = summary.total, "dry run complete");
        return;
    }

    info!(
        total = summary.total,
        committed = summary.committed,
        already_complete = summary.already_complete,
        failed = summary.failed,
        interrupted = summary.interrupted,
        bytes = %format_bytes(summary.bytes),
        duration = %format_duration(summary.duration_s),
        "run complete"
    );

    for (strategy, tally) in &summary.by_strategy {
        info!(
            strategy = strategy.as_str(),
            succeeded = tally.succeeded,
            failed = tally.failed,
            "strategy usage"
        );
    }

    for (url, error) in summary.errors.iter().take(ERROR_LISTING_CAP) {
        warn!(url = url.as_str(), error = error.as_str(), "download failed");
    }
    if summary.errors.len() > ERROR_LISTING_CAP {
        warn!(
            omitted = summary.errors.len() - ERROR_LISTING_CAP,
            "additional failures not listed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn durations_scale_through_units() {
        assert_eq!(format_duration(12.3), "12.3s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(7200.0), "2.0h");
    }
}
