mod rate;
#[cfg(feature = "reqwest")]
mod reqwest_impl;
mod transport;

pub use rate::TokenBucket;
#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestTransport;
pub use transport::{
    ByteStream, HttpTransport, RangeReply, RangeSpan, RemoteInfo, RequestOptions,
};
