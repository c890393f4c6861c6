mod manifest;
mod origin;
mod prefetch;
mod relay;
mod server;

pub use manifest::*;
pub use origin::*;
pub use prefetch::*;
pub use relay::*;
pub use server::*;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio_stream::wrappers::ReceiverStream;
use url::form_urlencoded;

/// Route serving raw media bytes (tee-to-cache passthrough).
pub const BINARY_ROUTE: &str = "/proxy";
/// Route serving rewritten HLS playlists.
pub const MANIFEST_ROUTE: &str = "/proxy-hls";

pub(crate) type ProxyBody = BoxBody<Bytes, std::io::Error>;

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Body fed chunk-by-chunk from a relay task.
pub(crate) fn channel_body(rx: tokio::sync::mpsc::Receiver<Bytes>) -> ProxyBody {
    BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx).map(|bytes| Ok(Frame::data(bytes)))))
}

/// Body streaming a cached file straight off disk.
pub(crate) fn file_body(file: tokio::fs::File) -> ProxyBody {
    BodyExt::boxed(StreamBody::new(
        tokio_util::io::ReaderStream::new(file).map(|res| res.map(Frame::data)),
    ))
}

/// Builds the local URL that routes `absolute_url` back through the proxy.
pub(crate) fn encode_proxy_url(port: u16, route: &str, absolute_url: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(absolute_url.as_bytes()).collect();
    format!("http://127.0.0.1:{port}{route}?url={encoded}")
}

/// Pulls the `url` parameter out of a request query string.
pub(crate) fn decode_url_param(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "url")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_round_trips_through_query_param() {
        let original = "https://cdn.example/movie/seg_001.ts?token=a%20b&x=1";
        let local = encode_proxy_url(8080, BINARY_ROUTE, original);
        let parsed = url::Url::parse(&local).unwrap();
        assert_eq!(parsed.path(), BINARY_ROUTE);
        let decoded = decode_url_param(parsed.query().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }
}
