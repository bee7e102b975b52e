//! Scriptable in-process origin for exercising the cascade without sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{stream, StreamExt};

use crate::error::FetchFailure;
use crate::net::{ByteStream, HttpTransport, RangeReply, RangeSpan, RemoteInfo, RequestOptions};

const CHUNK: usize = 64 * 1024;

/// Emit a connection reset once the origin has served this many payload
/// bytes in total.
pub(crate) struct FailAfter {
    pub after_total: u64,
    pub served: u64,
    pub remaining: u32,
}

/// Serve this many bytes of a request, then stop writing without closing.
pub(crate) struct StallPlan {
    pub after_bytes: u64,
    pub remaining: u32,
}

/// Swap content (and optionally the validator) starting at the Nth GET.
pub(crate) struct Flip {
    pub on_get: u32,
    pub new_data: Vec<u8>,
    pub new_etag: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestRecord {
    pub span: RangeSpan,
    pub close_connection: bool,
    pub if_range: Option<String>,
}

#[derive(Default)]
pub(crate) struct MockOrigin {
    pub data: Mutex<Vec<u8>>,
    pub etag: Mutex<Option<String>>,
    pub accept_ranges: bool,
    pub advertise_length: bool,
    /// Answer every ranged request with a 200 full body.
    pub respond_200_to_ranges: bool,
    pub fail_after: Mutex<Option<FailAfter>>,
    pub stall: Mutex<Option<StallPlan>>,
    pub flip: Mutex<Option<Flip>>,
    pub probes: AtomicU32,
    pub gets: AtomicU32,
    pub requests: Mutex<Vec<RequestRecord>>,
}

impl MockOrigin {
    pub fn serving(data: Vec<u8>, etag: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            etag: Mutex::new(etag.map(str::to_string)),
            accept_ranges: true,
            advertise_length: true,
            ..Default::default()
        })
    }

    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.requests.lock().unwrap().clone()
    }
}

pub(crate) struct MockTransport(pub Arc<MockOrigin>);

impl HttpTransport for MockTransport {
    async fn probe(&self, _url: &str) -> Result<RemoteInfo, FetchFailure> {
        let origin = &self.0;
        origin.probes.fetch_add(1, Ordering::SeqCst);
        let len = origin.data.lock().unwrap().len() as u64;
        Ok(RemoteInfo {
            content_length: origin.advertise_length.then_some(len),
            etag: origin.etag.lock().unwrap().clone(),
            last_modified: None,
            accept_ranges: origin.accept_ranges,
            final_url: None,
        })
    }

    async fn get(
        &self,
        _url: &str,
        span: RangeSpan,
        options: RequestOptions,
    ) -> Result<RangeReply, FetchFailure> {
        let origin = &self.0;
        let n = origin.gets.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut flip = origin.flip.lock().unwrap();
            let due = flip.as_ref().is_some_and(|pending| n >= pending.on_get);
            if due {
                let pending = flip.take().unwrap();
                *origin.data.lock().unwrap() = pending.new_data;
                if let Some(etag) = pending.new_etag {
                    *origin.etag.lock().unwrap() = Some(etag);
                }
            }
        }

        origin.requests.lock().unwrap().push(RequestRecord {
            span,
            close_connection: options.close_connection,
            if_range: options.if_range.clone(),
        });

        let data = origin.data.lock().unwrap().clone();
        let etag = origin.etag.lock().unwrap().clone();
        let len = data.len() as u64;

        let if_range_rejected = match (&options.if_range, &etag) {
            (Some(validator), Some(current)) => validator != current,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let serve_full = matches!(span, RangeSpan::Whole)
            || origin.respond_200_to_ranges
            || if_range_rejected;

        let (partial, start, end) = if serve_full {
            (false, 0, len)
        } else {
            match span {
                RangeSpan::Whole => unreachable!(),
                RangeSpan::From(s) => (true, s.min(len), len),
                RangeSpan::Bounded { start, end } => (true, start.min(len), end.min(len)),
                RangeSpan::Suffix(n) => (true, len.saturating_sub(n), len),
            }
        };

        let payload = data[start as usize..end as usize].to_vec();
        let stream = origin.build_stream(payload);

        Ok(RangeReply {
            partial,
            range_start: if partial { start } else { 0 },
            total_length: if partial || origin.advertise_length {
                Some(len)
            } else {
                None
            },
            etag,
            stream,
        })
    }
}

impl MockOrigin {
    fn build_stream(&self, payload: Vec<u8>) -> ByteStream {
        let mut items: Vec<Result<Bytes, FetchFailure>> = Vec::new();
        let mut hang = false;
        let mut served_this_request = 0u64;

        let mut fail_after = self.fail_after.lock().unwrap();
        let mut stall = self.stall.lock().unwrap();

        for chunk in payload.chunks(CHUNK) {
            if let Some(plan) = stall.as_mut()
                && plan.remaining > 0
                && served_this_request >= plan.after_bytes
            {
                plan.remaining -= 1;
                hang = true;
                break;
            }
            if let Some(plan) = fail_after.as_mut()
                && plan.remaining > 0
                && plan.served >= plan.after_total
            {
                plan.remaining -= 1;
                items.push(Err(FetchFailure::connection_reset()));
                break;
            }
            items.push(Ok(Bytes::copy_from_slice(chunk)));
            served_this_request += chunk.len() as u64;
            if let Some(plan) = fail_after.as_mut() {
                plan.served += chunk.len() as u64;
            }
        }

        if hang {
            Box::pin(stream::iter(items).chain(stream::pending()))
        } else {
            Box::pin(stream::iter(items))
        }
    }
}
