use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use http::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheJanitor, CacheKey, ChunkStore, CleanStats};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::manifest::is_manifest_url;
use crate::proxy::{
    decode_url_param, empty_body, encode_proxy_url, HttpOrigin, InflightRegistry,
    ManifestRewriter, Origin, Prefetcher, ProxyBody, StreamRelay, BINARY_ROUTE, MANIFEST_ROUTE,
};

/// The single network-facing surface: a loopback HTTP server on an
/// ephemeral port, plus the in-process API the player calls.
///
/// Explicitly constructed and owned; `start` is idempotent, `shutdown` is
/// best-effort (in-flight writes may be abandoned — partial files are a
/// tolerated state).
pub struct ProxyServer {
    config: ProxyConfig,
    custom_origin: Option<Arc<dyn Origin>>,
    inner: Mutex<Option<Arc<ServerInner>>>,
}

struct ServerInner {
    local_addr: SocketAddr,
    store: Arc<ChunkStore>,
    relay: StreamRelay,
    rewriter: ManifestRewriter,
    prefetcher: Prefetcher,
    janitor: CacheJanitor,
    cancel: CancellationToken,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            custom_origin: None,
            inner: Mutex::new(None),
        }
    }

    /// Substitutes the upstream client; test seam.
    pub fn with_origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.custom_origin = Some(origin);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().as_ref().map(|inner| inner.local_addr)
    }

    /// Creates the cache directory, binds a loopback ephemeral port and
    /// spawns the accept loop and the janitor. Calling it again returns the
    /// already-bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(inner) = &*self.inner.lock() {
            return Ok(inner.local_addr);
        }

        let store = Arc::new(
            ChunkStore::new(&self.config.cache_dir, self.config.playable_threshold)
                .await
                .map_err(ProxyError::DiskWrite)?,
        );
        let origin: Arc<dyn Origin> = match &self.custom_origin {
            Some(origin) => Arc::clone(origin),
            None => Arc::new(HttpOrigin::new(
                self.config.origin_timeout,
                self.config.max_retries,
            )?),
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(ProxyError::Bind)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;

        let registry = Arc::new(InflightRegistry::default());
        let cancel = CancellationToken::new();
        let inner = Arc::new(ServerInner {
            local_addr,
            store: Arc::clone(&store),
            relay: StreamRelay::new(
                Arc::clone(&store),
                Arc::clone(&origin),
                Arc::clone(&registry),
                self.config.clone(),
            ),
            rewriter: ManifestRewriter::new(Arc::clone(&origin), local_addr.port()),
            prefetcher: Prefetcher::new(
                Arc::clone(&store),
                origin,
                registry,
                self.config.clone(),
            ),
            janitor: CacheJanitor::new(Arc::clone(&store), self.config.clone()),
            cancel: cancel.clone(),
        });

        {
            let mut slot = self.inner.lock();
            if let Some(existing) = &*slot {
                // lost a concurrent start; discard ours before any task spawns
                cancel.cancel();
                return Ok(existing.local_addr);
            }
            *slot = Some(Arc::clone(&inner));
        }

        spawn_accept_loop(Arc::clone(&inner), listener, self.config.max_connections);
        CacheJanitor::new(store, self.config.clone()).spawn(cancel);

        info!(addr = %local_addr, "video cache proxy started");
        Ok(local_addr)
    }

    /// Rewrites an origin URL into its proxied local form. Pure string
    /// transform, no I/O: returns the input unchanged when the server has
    /// not started, the input is empty, unparseable, or already local.
    pub fn proxy_url(&self, original: &str) -> String {
        let inner = self.inner.lock().clone();
        let Some(inner) = inner else {
            return original.to_string();
        };
        let trimmed = original.trim();
        if trimmed.is_empty() {
            return original.to_string();
        }
        let Ok(parsed) = Url::parse(trimmed) else {
            return original.to_string();
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return original.to_string();
        }
        if is_loopback_host(&parsed) {
            return original.to_string();
        }
        let route = if is_manifest_url(&parsed) {
            MANIFEST_ROUTE
        } else {
            BINARY_ROUTE
        };
        encode_proxy_url(inner.local_addr.port(), route, trimmed)
    }

    /// Whether a playable entry for `url` is on disk right now.
    pub fn is_cached(&self, url: &str) -> bool {
        match &*self.inner.lock() {
            Some(inner) => inner.store.exists(&CacheKey::from_url(url)),
            None => false,
        }
    }

    /// Kicks off a background head-of-file download; see [`Prefetcher`].
    /// `max_bytes = None` uses the configured default.
    pub fn prefetch(&self, url: &str, max_bytes: Option<u64>) {
        let Some(inner) = self.inner.lock().clone() else {
            return;
        };
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(err) = inner.prefetcher.prefetch(&url, max_bytes).await {
                debug!(url, error = %err, "prefetch failed");
            }
        });
    }

    /// Runs one janitor pass immediately.
    pub async fn clean_cache(&self) -> CleanStats {
        let inner = self.inner.lock().clone();
        match inner {
            Some(inner) => inner.janitor.run_once().await,
            None => CleanStats::default(),
        }
    }

    /// A random fully-cached video file, for instant-splash screens.
    pub async fn random_cached_video(&self) -> Option<PathBuf> {
        let inner = self.inner.lock().clone()?;
        inner.store.random_playable(true).await
    }

    /// Stops accepting connections and cancels background tasks.
    pub fn shutdown(&self) {
        if let Some(inner) = self.inner.lock().take() {
            inner.cancel.cancel();
            info!("video cache proxy stopped");
        }
    }
}

fn is_loopback_host(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("127.0.0.1") | Some("localhost") | Some("[::1]") | Some("::1")
    )
}

fn spawn_accept_loop(inner: Arc<ServerInner>, listener: TcpListener, max_connections: usize) {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let conn_inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let service_inner = Arc::clone(&conn_inner);
                        let service = service_fn(move |req| {
                            let inner = Arc::clone(&service_inner);
                            async move { Ok::<_, Infallible>(inner.handle(req).await) }
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %err, "connection closed");
                        }
                    });
                }
            }
        }
        debug!("accept loop stopped");
    });
}

impl ServerInner {
    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let path = req.uri().path();
        if path != BINARY_ROUTE && path != MANIFEST_ROUTE {
            return status_only(StatusCode::NOT_FOUND);
        }

        let target = req
            .uri()
            .query()
            .and_then(decode_url_param)
            .and_then(|raw| Url::parse(&raw).ok());
        let Some(target) = target else {
            debug!(uri = %req.uri(), "missing or invalid url parameter");
            return status_only(StatusCode::BAD_REQUEST);
        };

        if path == MANIFEST_ROUTE {
            self.rewriter.serve(&target).await
        } else {
            self.relay.serve(&target, req.headers()).await
        }
    }
}

fn status_only(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn proxy_url_is_identity_before_start() {
        let server = ProxyServer::new(ProxyConfig::default());
        let original = "https://cdn.example/video.mp4";
        assert_eq!(server.proxy_url(original), original);
        assert!(!server.is_cached(original));
    }

    #[tokio::test]
    async fn proxy_url_classifies_by_extension() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(ProxyConfig::default().with_cache_dir(dir.path()));
        let addr = server.start().await.unwrap();

        let manifest = server.proxy_url("https://cdn.example/movie/index.m3u8");
        assert!(manifest.starts_with(&format!("http://127.0.0.1:{}/proxy-hls?url=", addr.port())));

        let binary = server.proxy_url("https://cdn.example/movie/video.mp4");
        assert!(binary.starts_with(&format!("http://127.0.0.1:{}/proxy?url=", addr.port())));

        server.shutdown();
    }

    #[tokio::test]
    async fn proxy_url_leaves_degenerate_inputs_alone() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(ProxyConfig::default().with_cache_dir(dir.path()));
        server.start().await.unwrap();

        assert_eq!(server.proxy_url(""), "");
        assert_eq!(server.proxy_url("not a url"), "not a url");
        assert_eq!(
            server.proxy_url("file:///sdcard/video.mp4"),
            "file:///sdcard/video.mp4"
        );
        let already_local = "http://127.0.0.1:9999/proxy?url=x";
        assert_eq!(server.proxy_url(already_local), already_local);

        server.shutdown();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(ProxyConfig::default().with_cache_dir(dir.path()));
        let first = server.start().await.unwrap();
        let second = server.start().await.unwrap();
        assert_eq!(first, second);
        server.shutdown();
        // shutting down twice is harmless
        server.shutdown();
    }
}
