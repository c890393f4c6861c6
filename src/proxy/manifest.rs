use std::sync::Arc;

use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::Response;
use tracing::{debug, warn};
use url::Url;

use crate::proxy::{
    empty_body, encode_proxy_url, full_body, Origin, ProxyBody, BINARY_ROUTE, MANIFEST_ROUTE,
};

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Serves HLS playlists with every referenced URI re-routed through the
/// proxy. Playlists are always re-fetched from the origin (live playlists
/// shift their segment window), never stored in the chunk store.
pub struct ManifestRewriter {
    origin: Arc<dyn Origin>,
    local_port: u16,
}

impl ManifestRewriter {
    pub fn new(origin: Arc<dyn Origin>, local_port: u16) -> Self {
        Self { origin, local_port }
    }

    pub async fn serve(&self, target: &Url) -> Response<ProxyBody> {
        let (status, body) = match self.origin.fetch_text(target).await {
            Ok(result) => result,
            Err(err) => {
                warn!(url = %target, error = %err, "manifest fetch failed");
                return Response::builder()
                    .status(err.client_status())
                    .body(empty_body())
                    .unwrap_or_else(|_| Response::new(empty_body()));
            }
        };

        if !status.is_success() {
            // origin verdict passes through verbatim
            return Response::builder()
                .status(status)
                .body(full_body(body))
                .unwrap_or_else(|_| Response::new(empty_body()));
        }

        let rewritten = rewrite_manifest(&body, target, self.local_port);
        debug!(url = %target, bytes = rewritten.len(), "manifest rewritten");
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, HLS_CONTENT_TYPE)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full_body(rewritten))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }
}

/// Pure line-by-line rewrite of a playlist body against its base URL.
///
/// Tag (`#`) and blank lines pass through untouched; anything else is a URI,
/// resolved to absolute and pointed at the proxy's manifest or binary route
/// by file extension. A line that does not resolve as a URL also passes
/// through untouched: dropping a segment line corrupts playback, a bare
/// origin URL merely skips the cache.
pub fn rewrite_manifest(body: &str, base: &Url, local_port: u16) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            match base.join(trimmed) {
                Ok(resolved) => {
                    let route = if is_manifest_url(&resolved) {
                        MANIFEST_ROUTE
                    } else {
                        BINARY_ROUTE
                    };
                    out.push_str(&encode_proxy_url(local_port, route, resolved.as_str()));
                }
                Err(err) => {
                    warn!(line = trimmed, error = %err, "unresolvable playlist line kept as-is");
                    out.push_str(line);
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Sub-playlist vs media segment, decided by path extension.
pub(crate) fn is_manifest_url(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}
