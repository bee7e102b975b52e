//! Error taxonomy for the download core.
//!
//! Failures are classes, not types: every transport, filesystem, or tool
//! error is mapped into one of the closed [`ErrorClass`] variants at the
//! boundary where it occurs, and the cascade manager drives purely on the
//! class. The detail string is a short stable token (`stalled`,
//! `http_5xx:503`, `disk_full`) suitable for history records and logs; no
//! stack traces surface.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient transport trouble; absorbed in-strategy up to the retry
    /// budget, then advances the cascade.
    Retryable,
    /// No `bytes_written` progress within the threshold; advances immediately.
    Stalled,
    /// The remote resource changed mid-transfer; partial progress is void.
    ValidatorChanged,
    /// Final digest mismatched a known validator.
    IntegrityFailed,
    /// The current strategy cannot proceed against this server.
    Unsupported,
    /// Not worth retrying anywhere; short-circuits the manager.
    Fatal,
    /// Process-wide cancellation; the manager checkpoints and stops.
    Interrupted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{detail}")]
pub struct FetchFailure {
    pub class: ErrorClass,
    pub detail: String,
}

impl FetchFailure {
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }

    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retryable, detail)
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, detail)
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unsupported, detail)
    }

    pub fn stalled() -> Self {
        Self::new(ErrorClass::Stalled, "stalled")
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorClass::Interrupted, "interrupted")
    }

    pub fn validator_changed() -> Self {
        Self::new(ErrorClass::ValidatorChanged, "validator_changed")
    }

    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::IntegrityFailed, detail.into())
    }

    pub fn timeout() -> Self {
        Self::retryable("timeout")
    }

    pub fn connection_reset() -> Self {
        Self::retryable("connection_reset")
    }

    pub fn truncated_body() -> Self {
        Self::retryable("truncated_body")
    }

    pub fn dns() -> Self {
        Self::fatal("dns")
    }

    /// Classify an HTTP status code.
    pub fn http_status(status: u16) -> Self {
        match status {
            429 => Self::retryable("http_429"),
            500..=599 => Self::retryable(format!("http_5xx:{status}")),
            401 | 403 => Self::fatal(format!("http_{status}")),
            416 => Self::unsupported("http_416"),
            400..=499 => Self::unsupported(format!("http_4xx:{status}")),
            other => Self::retryable(format!("http_{other}")),
        }
    }

    /// Classify a local I/O error.
    pub fn io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Self::fatal("disk_full"),
            ErrorKind::PermissionDenied => Self::fatal("permission_denied"),
            ErrorKind::TimedOut => Self::timeout(),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::connection_reset()
            }
            kind => Self::retryable(format!("io:{kind:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classes() {
        assert_eq!(FetchFailure::http_status(503).class, ErrorClass::Retryable);
        assert_eq!(FetchFailure::http_status(503).detail, "http_5xx:503");
        assert_eq!(FetchFailure::http_status(429).class, ErrorClass::Retryable);
        assert_eq!(FetchFailure::http_status(403).class, ErrorClass::Fatal);
        assert_eq!(FetchFailure::http_status(416).class, ErrorClass::Unsupported);
        assert_eq!(FetchFailure::http_status(404).detail, "http_4xx:404");
    }

    #[test]
    fn io_errors_map_to_stable_tokens() {
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space");
        assert_eq!(FetchFailure::io(&full).detail, "disk_full");
        assert_eq!(FetchFailure::io(&full).class, ErrorClass::Fatal);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(FetchFailure::io(&denied).detail, "permission_denied");
    }

    #[test]
    fn failure_displays_detail_only() {
        assert_eq!(FetchFailure::stalled().to_string(), "stalled");
        assert_eq!(
            FetchFailure::validator_changed().to_string(),
            "validator_changed"
        );
    }
}
