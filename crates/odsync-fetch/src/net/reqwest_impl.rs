use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode};

use crate::config::HttpConfig;
use crate::error::FetchFailure;
use crate::net::transport::{
    parse_content_range, ByteStream, HttpTransport, RangeReply, RangeSpan, RemoteInfo,
    RequestOptions,
};

const MAX_REDIRECTS: usize = 10;

/// Production transport over a shared `reqwest::Client`.
///
/// The client always requests identity encoding so `Content-Length` stays
/// meaningful for ranged transfers, and follows redirects up to a small
/// bound while the stored resource identity remains the request URL.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, FetchFailure> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchFailure::fatal(format!("bad_header:{name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FetchFailure::fatal(format!("bad_header:{name}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(config.timeout_connect_s))
            .read_timeout(Duration::from_secs(config.timeout_read_s))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));
        if !config.http2 {
            builder = builder.http1_only();
        }

        let client = builder
            .build()
            .map_err(|e| FetchFailure::fatal(format!("client_build:{e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn probe(&self, url: &str) -> Result<RemoteInfo, FetchFailure> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => Ok(info_from_head(&response)),
            Ok(response) if head_unsupported(response.status()) => self.probe_via_get(url).await,
            Ok(response) => Err(FetchFailure::http_status(response.status().as_u16())),
            Err(e) => Err(map_reqwest_error(&e)),
        }
    }

    async fn get(
        &self,
        url: &str,
        span: RangeSpan,
        options: RequestOptions,
    ) -> Result<RangeReply, FetchFailure> {
        let mut request = self.client.get(url);
        if let Some(range) = span.header_value() {
            request = request.header(header::RANGE, range);
        }
        if let Some(validator) = &options.if_range {
            request = request.header(header::IF_RANGE, validator.clone());
        }
        if options.close_connection {
            request = request.header(header::CONNECTION, "close");
        }

        let response = request.send().await.map_err(|e| map_reqwest_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::http_status(status.as_u16()));
        }

        let etag = header_string(&response, header::ETAG);
        let content_length = header_u64(&response, header::CONTENT_LENGTH);

        let (partial, range_start, total_length) = if status == StatusCode::PARTIAL_CONTENT {
            let content_range = header_string(&response, header::CONTENT_RANGE)
                .as_deref()
                .and_then(parse_content_range)
                .ok_or_else(|| FetchFailure::retryable("bad_content_range"))?;
            (true, content_range.0, content_range.1)
        } else {
            (false, 0, content_length)
        };

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| map_reqwest_error(&e))),
        );

        Ok(RangeReply {
            partial,
            range_start,
            total_length,
            etag,
            stream,
        })
    }
}

impl ReqwestTransport {
    /// Probe fallback for servers without HEAD: a one-byte ranged GET whose
    /// body is dropped as soon as the headers are in.
    async fn probe_via_get(&self, url: &str) -> Result<RemoteInfo, FetchFailure> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::http_status(status.as_u16()));
        }

        let mut info = info_from_head(&response);
        if status == StatusCode::PARTIAL_CONTENT {
            info.accept_ranges = true;
            // Content-Length describes the one-byte body here; the real
            // length is the Content-Range total.
            info.content_length = header_string(&response, header::CONTENT_RANGE)
                .as_deref()
                .and_then(parse_content_range)
                .and_then(|(_, total)| total);
        }
        drop(response);
        Ok(info)
    }
}

fn head_unsupported(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED | StatusCode::FORBIDDEN
    )
}

fn info_from_head(response: &Response) -> RemoteInfo {
    RemoteInfo {
        content_length: header_u64(response, header::CONTENT_LENGTH),
        etag: header_string(response, header::ETAG),
        last_modified: header_string(response, header::LAST_MODIFIED),
        accept_ranges: header_string(response, header::ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false),
        final_url: Some(response.url().to_string()),
    }
}

fn header_string(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_u64(response: &Response, name: HeaderName) -> Option<u64> {
    header_string(response, name).and_then(|v| v.parse().ok())
}

fn map_reqwest_error(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        return FetchFailure::timeout();
    }
    if err.is_connect() {
        let text = err.to_string();
        if text.contains("dns") {
            return FetchFailure::dns();
        }
        return FetchFailure::retryable("connect");
    }
    if err.is_redirect() {
        return FetchFailure::unsupported("too_many_redirects");
    }
    if err.is_body() || err.is_decode() {
        return FetchFailure::connection_reset();
    }
    FetchFailure::retryable("network")
}
