//! End-to-end tests: a real proxy instance in front of an in-process mock
//! origin that counts how often each resource is fetched.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use video_cache_proxy::{ProxyConfig, ProxyServer};

#[derive(Clone)]
struct Route {
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
    /// Send the body in pieces of this size instead of one frame.
    chunk_size: Option<usize>,
    /// Declare the full length but stop sending after this many bytes.
    truncate_at: Option<usize>,
}

impl Route {
    fn video(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "video/mp4",
            body: Bytes::from(body),
            chunk_size: None,
            truncate_at: None,
        }
    }

    fn manifest(text: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/vnd.apple.mpegurl",
            body: Bytes::from(text.to_string()),
            chunk_size: None,
            truncate_at: None,
        }
    }

    fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    fn truncated(mut self, at: usize) -> Self {
        self.truncate_at = Some(at);
        self
    }
}

struct MockOrigin {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockOrigin {
    async fn spawn(routes: HashMap<&'static str, Route>) -> Self {
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        );
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&routes);
                let hits = Arc::clone(&task_hits);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let routes = Arc::clone(&routes);
                        let hits = Arc::clone(&hits);
                        async move { Ok::<_, Infallible>(serve_route(&req, &routes, &hits)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, hits }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

fn serve_route(
    req: &Request<hyper::body::Incoming>,
    routes: &HashMap<String, Route>,
    hits: &Mutex<HashMap<String, usize>>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let path = req.uri().path().to_string();
    *hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let Some(route) = routes.get(&path) else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()).boxed())
            .unwrap();
    };

    if route.chunk_size.is_none() && route.truncate_at.is_none() {
        return Response::builder()
            .status(route.status)
            .header(CONTENT_TYPE, route.content_type)
            .body(Full::new(route.body.clone()).boxed())
            .unwrap();
    }

    // stream piecewise, optionally stopping short of the declared length
    let body = route.body.clone();
    let send_len = route.truncate_at.unwrap_or(body.len()).min(body.len());
    let chunk = route.chunk_size.unwrap_or(8 * 1024);
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(4);
    tokio::spawn(async move {
        let mut sent = 0;
        while sent < send_len {
            let end = (sent + chunk).min(send_len);
            if tx.send(body.slice(sent..end)).await.is_err() {
                return;
            }
            sent = end;
        }
    });

    Response::builder()
        .status(route.status)
        .header(CONTENT_TYPE, route.content_type)
        .header(CONTENT_LENGTH, route.body.len())
        .body(BodyExt::boxed(StreamBody::new(
            ReceiverStream::new(rx).map(|b| Ok(Frame::data(b))),
        )))
        .unwrap()
}

fn test_config(dir: &TempDir) -> ProxyConfig {
    ProxyConfig::default()
        .with_cache_dir(dir.path())
        .with_playable_threshold(2_000)
        .with_origin_timeout(Duration::from_secs(2))
}

fn body_of(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

async fn wait_until(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn cached_chunk_sizes(dir: &TempDir) -> Vec<u64> {
    let mut sizes: Vec<u64> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("chunk"))
        .map(|e| e.metadata().unwrap().len())
        .collect();
    sizes.sort_unstable();
    sizes
}

#[tokio::test]
async fn second_fetch_is_served_from_cache() {
    let body = body_of(8 * 1024);
    let origin = MockOrigin::spawn(HashMap::from([("/video.mp4", Route::video(body.clone()))])).await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    let source = origin.url("/video.mp4");
    let local = server.proxy_url(&source);
    assert_ne!(local, source);

    let first = reqwest::get(&local).await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(
        first.headers().get(CONTENT_TYPE).unwrap(),
        "video/mp4"
    );
    let first_bytes = first.bytes().await.unwrap();
    assert_eq!(&first_bytes[..], &body[..]);

    assert!(wait_until(|| server.is_cached(&source)).await, "entry never completed");
    assert_eq!(cached_chunk_sizes(&dir), vec![body.len() as u64]);

    let second_bytes = reqwest::get(&local).await.unwrap().bytes().await.unwrap();
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(origin.hits("/video.mp4"), 1, "cache hit must not refetch");

    server.shutdown();
}

#[tokio::test]
async fn truncated_transfer_keeps_exact_partial() {
    let routes = HashMap::from([
        (
            "/under.mp4",
            Route::video(body_of(8 * 1024)).chunked(500).truncated(1_000),
        ),
        (
            "/over.mp4",
            Route::video(body_of(8 * 1024)).chunked(500).truncated(3_000),
        ),
    ]);
    let origin = MockOrigin::spawn(routes).await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    // truncated below the 2000-byte playability threshold
    let under = origin.url("/under.mp4");
    let response = reqwest::get(server.proxy_url(&under)).await.unwrap();
    let _ = response.bytes().await; // transfer dies mid-stream
    assert!(wait_until(|| cached_chunk_sizes(&dir) == vec![1_000]).await);
    assert!(!server.is_cached(&under), "sub-threshold partial is not playable");

    // truncated above the threshold: partial but usable
    let over = origin.url("/over.mp4");
    let response = reqwest::get(server.proxy_url(&over)).await.unwrap();
    let _ = response.bytes().await;
    assert!(wait_until(|| cached_chunk_sizes(&dir) == vec![1_000, 3_000]).await);
    assert!(wait_until(|| server.is_cached(&over)).await);

    server.shutdown();
}

#[tokio::test]
async fn concurrent_requests_fetch_origin_once() {
    let body = body_of(256 * 1024);
    let origin = MockOrigin::spawn(HashMap::from([(
        "/big.mp4",
        Route::video(body.clone()).chunked(4 * 1024),
    )]))
    .await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    let local = server.proxy_url(&origin.url("/big.mp4"));
    let client = reqwest::Client::new();
    let (a, b) = tokio::join!(
        client.get(&local).send(),
        client.get(&local).send()
    );
    let a = a.unwrap().bytes().await.unwrap();
    let b = b.unwrap().bytes().await.unwrap();

    assert_eq!(&a[..], &body[..]);
    assert_eq!(&b[..], &body[..]);
    assert_eq!(origin.hits("/big.mp4"), 1, "single-flight must hold");

    server.shutdown();
}

#[tokio::test]
async fn manifest_is_rewritten_and_never_cached() {
    let manifest = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nvariant_480p.m3u8\nseg_000.ts\n";
    let origin = MockOrigin::spawn(HashMap::from([(
        "/movie/index.m3u8",
        Route::manifest(manifest),
    )]))
    .await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    let proxy_addr = server.start().await.unwrap();

    let local = server.proxy_url(&origin.url("/movie/index.m3u8"));
    assert!(local.contains("/proxy-hls?url="));

    let response = reqwest::get(&local).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");

    let text = response.text().await.unwrap();
    let proxied_prefix = format!("http://127.0.0.1:{}/", proxy_addr.port());
    for line in text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
        assert!(line.starts_with(&proxied_prefix), "bare origin URI leaked: {line}");
    }
    let variant_line = text.lines().nth(2).unwrap();
    assert!(variant_line.contains("/proxy-hls?url="));
    let segment_line = text.lines().nth(3).unwrap();
    assert!(segment_line.contains("/proxy?url="));

    // playlists are re-fetched every time, never served from the store
    let _ = reqwest::get(&local).await.unwrap().text().await.unwrap();
    assert_eq!(origin.hits("/movie/index.m3u8"), 2);
    assert!(cached_chunk_sizes(&dir).is_empty());

    server.shutdown();
}

#[tokio::test]
async fn origin_status_passes_through() {
    let origin = MockOrigin::spawn(HashMap::new()).await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    let local = server.proxy_url(&origin.url("/missing.mp4"));
    let response = reqwest::get(&local).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(origin.hits("/missing.mp4"), 1);
    assert!(cached_chunk_sizes(&dir).is_empty());

    server.shutdown();
}

#[tokio::test]
async fn bad_requests_get_400_not_a_crash() {
    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    let addr = server.start().await.unwrap();

    let no_param = format!("http://{addr}/proxy");
    assert_eq!(reqwest::get(&no_param).await.unwrap().status(), 400);

    let junk = format!("http://{addr}/proxy?url=not%20a%20url");
    assert_eq!(reqwest::get(&junk).await.unwrap().status(), 400);

    let unknown = format!("http://{addr}/elsewhere");
    assert_eq!(reqwest::get(&unknown).await.unwrap().status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn prefetch_stores_bounded_head() {
    let body = body_of(64 * 1024);
    let origin = MockOrigin::spawn(HashMap::from([(
        "/long.mp4",
        Route::video(body.clone()).chunked(512),
    )]))
    .await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    let source = origin.url("/long.mp4");
    server.prefetch(&source, Some(4_000));

    assert!(
        wait_until(|| cached_chunk_sizes(&dir).first().copied().unwrap_or(0) >= 4_000).await,
        "prefetch never materialized"
    );
    let sizes = cached_chunk_sizes(&dir);
    assert!(sizes[0] < body.len() as u64, "prefetch must stop at the cap");
    assert_eq!(origin.hits("/long.mp4"), 1);

    // the bounded head is above the playability threshold, so it is usable
    assert!(wait_until(|| server.is_cached(&source)).await);

    // prefetching a cached resource is a no-op
    server.prefetch(&source, Some(4_000));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(origin.hits("/long.mp4"), 1);

    server.shutdown();
}

#[tokio::test]
async fn clean_cache_evicts_oldest_until_under_target() {
    let routes = HashMap::from([
        ("/a.mp4", Route::video(body_of(4 * 1024))),
        ("/b.mp4", Route::video(body_of(4 * 1024))),
        ("/c.mp4", Route::video(body_of(4 * 1024))),
    ]);
    let origin = MockOrigin::spawn(routes).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir).with_max_cache_size(10 * 1024);
    let server = ProxyServer::new(config);
    server.start().await.unwrap();

    for path in ["/a.mp4", "/b.mp4", "/c.mp4"] {
        let source = origin.url(path);
        let local = server.proxy_url(&source);
        reqwest::get(&local).await.unwrap().bytes().await.unwrap();
        assert!(wait_until(|| server.is_cached(&source)).await);
        // distinct mtimes so eviction order is deterministic
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(cached_chunk_sizes(&dir).len(), 3);

    // 12 KiB stored, 10 KiB ceiling, 8 KiB target: exactly the oldest goes
    let stats = server.clean_cache().await;
    assert_eq!(stats.removed, 1);
    assert_eq!(cached_chunk_sizes(&dir).len(), 2);
    assert!(!server.is_cached(&origin.url("/a.mp4")));
    assert!(server.is_cached(&origin.url("/b.mp4")));
    assert!(server.is_cached(&origin.url("/c.mp4")));

    server.shutdown();
}

#[tokio::test]
async fn random_cached_video_picks_a_playable_file() {
    let origin = MockOrigin::spawn(HashMap::from([(
        "/splash.mp4",
        Route::video(body_of(4 * 1024)),
    )]))
    .await;

    let dir = TempDir::new().unwrap();
    let server = ProxyServer::new(test_config(&dir));
    server.start().await.unwrap();

    assert!(server.random_cached_video().await.is_none());

    let source = origin.url("/splash.mp4");
    reqwest::get(server.proxy_url(&source)).await.unwrap().bytes().await.unwrap();
    assert!(wait_until(|| server.is_cached(&source)).await);

    let picked = server.random_cached_video().await.expect("one candidate");
    assert_eq!(picked.extension().and_then(|e| e.to_str()), Some("chunk"));
    assert_eq!(std::fs::metadata(&picked).unwrap().len(), 4 * 1024);

    server.shutdown();
}
