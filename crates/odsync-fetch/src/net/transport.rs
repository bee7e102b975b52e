//! HTTP transport abstraction.
//!
//! The download core talks to origins exclusively through [`HttpTransport`].
//! The production implementation is [`ReqwestTransport`](super::ReqwestTransport);
//! tests script mock implementations. All transport-level errors are mapped
//! into the [`FetchFailure`] taxonomy here at the boundary, never above.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::FetchFailure;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchFailure>> + Send>>;

/// What a probe learned about a remote resource.
#[derive(Debug, Clone, Default)]
pub struct RemoteInfo {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub accept_ranges: bool,
    /// URL after redirects; the stored resource identity stays the plan URL.
    pub final_url: Option<String>,
}

/// Byte span of a GET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpan {
    /// Plain GET, no Range header.
    Whole,
    /// `Range: bytes=start-` to the end of the resource.
    From(u64),
    /// `Range: bytes=start-(end-1)`; `end` is exclusive.
    Bounded { start: u64, end: u64 },
    /// `Range: bytes=-n`, the final `n` bytes.
    Suffix(u64),
}

impl RangeSpan {
    pub fn header_value(&self) -> Option<String> {
        match self {
            RangeSpan::Whole => None,
            RangeSpan::From(start) => Some(format!("bytes={start}-")),
            RangeSpan::Bounded { start, end } => {
                Some(format!("bytes={start}-{}", end.saturating_sub(1)))
            }
            RangeSpan::Suffix(n) => Some(format!("bytes=-{n}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Send `Connection: close` so the server tears the socket down after
    /// this response.
    pub close_connection: bool,
    /// `If-Range` validator; the server answers with the full body instead
    /// of the range when the resource changed.
    pub if_range: Option<String>,
}

/// A GET response ready for streaming.
pub struct RangeReply {
    /// Whether the server honored the range (`206 Partial Content`).
    pub partial: bool,
    /// Offset the body starts at; 0 for full replies.
    pub range_start: u64,
    /// Complete resource length, from `Content-Range` or `Content-Length`.
    pub total_length: Option<u64>,
    pub etag: Option<String>,
    pub stream: ByteStream,
}

pub trait HttpTransport: Send + Sync {
    /// Discover resource metadata without transferring the body.
    ///
    /// Implementations try `HEAD` first and fall back to a one-byte ranged
    /// GET whose body is dropped unread when the server rejects `HEAD`.
    fn probe(&self, url: &str) -> impl Future<Output = Result<RemoteInfo, FetchFailure>> + Send;

    /// Open a streaming GET over the given span.
    fn get(
        &self,
        url: &str,
        span: RangeSpan,
        options: RequestOptions,
    ) -> impl Future<Output = Result<RangeReply, FetchFailure>> + Send;
}

/// Parse a `Content-Range: bytes a-b/total` header into `(start, total)`.
/// The total is `None` for `*`.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    // An unsatisfied-range response carries "*/total"; there is no start.
    let (start, _) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    Some((start, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_forms() {
        assert_eq!(RangeSpan::Whole.header_value(), None);
        assert_eq!(
            RangeSpan::From(1024).header_value().as_deref(),
            Some("bytes=1024-")
        );
        assert_eq!(
            RangeSpan::Bounded { start: 0, end: 100 }.header_value().as_deref(),
            Some("bytes=0-99")
        );
        assert_eq!(
            RangeSpan::Suffix(4096).header_value().as_deref(),
            Some("bytes=-4096")
        );
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 0-0/1234"), Some((0, Some(1234))));
        assert_eq!(
            parse_content_range("bytes 512-1023/2048"),
            Some((512, Some(2048)))
        );
        assert_eq!(parse_content_range("bytes 512-1023/*"), Some((512, None)));
        assert_eq!(parse_content_range("chunks 0-1/2"), None);
        assert_eq!(parse_content_range("bytes */2048"), None);
    }
}
