use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{
    ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HOST,
    RANGE,
};
use http::{HeaderMap, StatusCode};
use hyper::Response;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheKey, ChunkStore, WriteHandle};
use crate::config::ProxyConfig;
use crate::proxy::{channel_body, empty_body, file_body, Origin, OriginResponse, ProxyBody};

const BROADCAST_CAPACITY: usize = 256;
const CLIENT_CHANNEL_CAPACITY: usize = 16;
const FILE_PUMP_BUF: usize = 64 * 1024;

/// Response metadata published by the owning relay once origin headers are in.
#[derive(Debug, Clone)]
pub(crate) enum FlightMeta {
    Ready {
        content_type: Option<String>,
        content_length: Option<u64>,
    },
    Failed {
        status: StatusCode,
    },
}

impl FlightMeta {
    pub(crate) fn ready_from(response: &OriginResponse) -> Self {
        Self::Ready {
            content_type: response.content_type.clone(),
            content_length: response.content_length,
        }
    }
}

/// One chunk of an in-progress download, addressed by absolute offset so
/// followers can deduplicate against bytes they back-filled from disk.
#[derive(Debug, Clone)]
pub(crate) struct FlightChunk {
    offset: u64,
    bytes: Bytes,
}

impl FlightChunk {
    pub(crate) fn new(offset: u64, bytes: Bytes) -> Self {
        Self { offset, bytes }
    }
}

/// A download currently in flight for one cache key.
pub(crate) struct Inflight {
    key: CacheKey,
    meta: watch::Receiver<Option<FlightMeta>>,
    data: broadcast::Sender<FlightChunk>,
    /// Prefetch flights stop at a byte cap and must not be joined by
    /// playback requests.
    capped: bool,
}

/// Removes the key from the registry when the owning relay ends, on every
/// exit path.
pub(crate) struct FlightGuard {
    key: CacheKey,
    registry: Arc<InflightRegistry>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry.map.lock().remove(&self.key);
    }
}

pub(crate) enum Admission {
    Owner {
        guard: FlightGuard,
        meta_tx: watch::Sender<Option<FlightMeta>>,
        data_tx: broadcast::Sender<FlightChunk>,
    },
    Follower(Arc<Inflight>),
}

/// Per-key registry closing the duplicate-fetch race: the first request for
/// an uncached key becomes the owner, later ones attach to its stream.
#[derive(Default)]
pub(crate) struct InflightRegistry {
    map: Mutex<HashMap<CacheKey, Arc<Inflight>>>,
}

impl InflightRegistry {
    pub(crate) fn admit(self: &Arc<Self>, key: &CacheKey, capped: bool) -> Admission {
        let mut map = self.map.lock();
        if let Some(flight) = map.get(key) {
            return Admission::Follower(Arc::clone(flight));
        }
        let (meta_tx, meta_rx) = watch::channel(None);
        let (data_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        map.insert(
            key.clone(),
            Arc::new(Inflight {
                key: key.clone(),
                meta: meta_rx,
                data: data_tx.clone(),
                capped,
            }),
        );
        Admission::Owner {
            guard: FlightGuard {
                key: key.clone(),
                registry: Arc::clone(self),
            },
            meta_tx,
            data_tx,
        }
    }
}

/// How a miss interacts with the cache, decided by the client's Range header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeeMode {
    /// No range, or an unbounded range from byte zero: tee and mark
    /// complete on a clean finish.
    Full,
    /// Bounded range from byte zero: the bytes are a valid prefix, so tee,
    /// but an early stop is expected and the entry can never be complete.
    Prefix,
    /// Mid-file range: the bytes would not be a prefix; pass through only.
    Off,
}

fn tee_mode(headers: &HeaderMap) -> TeeMode {
    let Some(value) = headers.get(RANGE) else {
        return TeeMode::Full;
    };
    let Ok(raw) = value.to_str() else {
        return TeeMode::Off;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return TeeMode::Off;
    };
    if spec.contains(',') {
        return TeeMode::Off;
    }
    let mut parts = spec.splitn(2, '-');
    match (parts.next(), parts.next()) {
        (Some("0"), Some("")) => TeeMode::Full,
        (Some("0"), Some(_)) => TeeMode::Prefix,
        _ => TeeMode::Off,
    }
}

/// Headers forwarded to the origin: everything the client sent except the
/// ones that describe the client connection itself.
fn origin_headers(client: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client {
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn response_builder(status: StatusCode) -> http::response::Builder {
    Response::builder()
        .status(status)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    response_builder(status)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Serves one client request for one media resource: from the cache on a
/// hit, from the origin with a tee to the cache on a miss, attaching to an
/// in-flight download when one exists.
pub struct StreamRelay {
    store: Arc<ChunkStore>,
    origin: Arc<dyn Origin>,
    registry: Arc<InflightRegistry>,
    config: ProxyConfig,
}

impl StreamRelay {
    pub(crate) fn new(
        store: Arc<ChunkStore>,
        origin: Arc<dyn Origin>,
        registry: Arc<InflightRegistry>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            origin,
            registry,
            config,
        }
    }

    pub async fn serve(&self, target: &Url, headers: &HeaderMap) -> Response<ProxyBody> {
        let key = CacheKey::from_url(target.as_str());

        if self.store.exists(&key) {
            debug!(url = %target, "cache hit");
            return self.serve_hit(&key).await;
        }

        let mode = tee_mode(headers);
        if mode == TeeMode::Off {
            debug!(url = %target, "mid-file range, pass-through");
            return self.serve_passthrough(target, headers).await;
        }

        // a bounded-range owner stops short of the whole resource, so its
        // flight is marked capped and never joined, like a prefetch
        match self.registry.admit(&key, mode != TeeMode::Full) {
            Admission::Follower(flight) if flight.capped => {
                // a prefetch will stop early; don't hang playback on it
                self.serve_passthrough(target, headers).await
            }
            Admission::Follower(flight) => {
                debug!(url = %target, "joining in-flight download");
                self.serve_follower(flight).await
            }
            Admission::Owner {
                guard,
                meta_tx,
                data_tx,
            } => {
                debug!(url = %target, "cache miss");
                self.serve_owner(target, headers, key, guard, meta_tx, data_tx)
                    .await
            }
        }
    }

    /// Cache hit: the stored file, whole, with its recorded content type.
    async fn serve_hit(&self, key: &CacheKey) -> Response<ProxyBody> {
        match self.store.open(key).await {
            Ok((file, len, content_type)) => response_builder(StatusCode::OK)
                .header(
                    CONTENT_TYPE,
                    content_type.as_deref().unwrap_or("application/octet-stream"),
                )
                .header(CONTENT_LENGTH, len)
                .body(file_body(file))
                .unwrap_or_else(|_| Response::new(empty_body())),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "hit entry unreadable");
                status_response(err.client_status())
            }
        }
    }

    /// Origin fetch with no cache interaction; used for mid-file ranges and
    /// for requests colliding with a capped prefetch.
    async fn serve_passthrough(&self, target: &Url, headers: &HeaderMap) -> Response<ProxyBody> {
        let response = match self.origin.fetch(target, &origin_headers(headers)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %target, error = %err, "origin fetch failed");
                return status_response(err.client_status());
            }
        };

        let mut builder = response_builder(response.status);
        for name in [CONTENT_TYPE, CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES] {
            if let Some(value) = response.headers.get(&name) {
                builder = builder.header(name, value.clone());
            }
        }

        let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
        let mut body = response.body;
        tokio::spawn(async move {
            while let Some(item) = body.next().await {
                match item {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "origin stream error");
                        break;
                    }
                }
            }
        });

        builder
            .body(channel_body(rx))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    /// Cache miss, first request: fetch from origin, stream to the client,
    /// tee to the chunk store, fan out to followers.
    async fn serve_owner(
        &self,
        target: &Url,
        headers: &HeaderMap,
        key: CacheKey,
        guard: FlightGuard,
        meta_tx: watch::Sender<Option<FlightMeta>>,
        data_tx: broadcast::Sender<FlightChunk>,
    ) -> Response<ProxyBody> {
        let response = match self.origin.fetch(target, &origin_headers(headers)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %target, error = %err, "origin fetch failed");
                let status = err.client_status();
                let _ = meta_tx.send(Some(FlightMeta::Failed { status }));
                return status_response(status);
            }
        };

        if !response.status.is_success() {
            // origin verdict passes through verbatim, nothing is cached
            debug!(url = %target, status = %response.status, "origin non-success");
            let _ = meta_tx.send(Some(FlightMeta::Failed {
                status: response.status,
            }));
            drop(guard);
            return self.forward_without_tee(response).await;
        }

        // disk trouble degrades this request to pass-through, never fails it
        let handle = match self
            .store
            .begin_write(&key, response.content_type.as_deref())
            .await
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "cache write unavailable");
                None
            }
        };

        let mode = tee_mode(headers);
        let _ = meta_tx.send(Some(FlightMeta::ready_from(&response)));

        let mut builder = response_builder(response.status);
        for name in [CONTENT_TYPE, CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES] {
            if let Some(value) = response.headers.get(&name) {
                builder = builder.header(name, value.clone());
            }
        }

        let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
        let abandoned_timeout = self.config.abandoned_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            let _meta_tx = meta_tx;
            owner_pump(
                response,
                handle,
                data_tx,
                tx,
                mode == TeeMode::Full,
                abandoned_timeout,
            )
            .await;
        });

        builder
            .body(channel_body(rx))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    /// Streams a non-2xx origin response body straight through.
    async fn forward_without_tee(&self, response: OriginResponse) -> Response<ProxyBody> {
        let mut builder = response_builder(response.status);
        if let Some(ct) = &response.content_type {
            builder = builder.header(CONTENT_TYPE, ct.as_str());
        }
        let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
        let mut body = response.body;
        tokio::spawn(async move {
            while let Some(Ok(bytes)) = body.next().await {
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });
        builder
            .body(channel_body(rx))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    /// Second request for a key already downloading: back-fill persisted
    /// bytes from disk, then ride the owner's broadcast.
    async fn serve_follower(&self, flight: Arc<Inflight>) -> Response<ProxyBody> {
        let mut meta_rx = flight.meta.clone();
        let meta = match meta_rx.wait_for(|meta| meta.is_some()).await {
            Ok(guard) => guard.clone(),
            // owner dropped before publishing headers
            Err(_) => None,
        };

        let (content_type, content_length) = match meta {
            Some(FlightMeta::Ready {
                content_type,
                content_length,
            }) => (content_type, content_length),
            Some(FlightMeta::Failed { status }) => return status_response(status),
            None => return status_response(StatusCode::BAD_GATEWAY),
        };

        // joined flights always carry the resource from byte zero, so the
        // follower's view is a plain full response
        let mut builder = response_builder(StatusCode::OK);
        if let Some(ct) = &content_type {
            builder = builder.header(CONTENT_TYPE, ct.as_str());
        }
        if let Some(len) = content_length {
            builder = builder.header(CONTENT_LENGTH, len);
        }

        // subscribe before the disk back-fill so nothing broadcast in
        // between is lost; overlap is deduplicated by offset
        let data_rx = flight.data.subscribe();
        let store = Arc::clone(&self.store);
        let key = flight.key.clone();
        let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            follower_pump(store, key, data_rx, tx).await;
        });

        builder
            .body(channel_body(rx))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }
}

/// The owner's streaming loop. Per-chunk order is: forward to the client,
/// append to disk, then broadcast — so the file never lags what followers
/// may rely on back-filling.
async fn owner_pump(
    response: OriginResponse,
    mut handle: Option<WriteHandle>,
    data_tx: broadcast::Sender<FlightChunk>,
    client_tx: mpsc::Sender<Bytes>,
    may_complete: bool,
    abandoned_timeout: std::time::Duration,
) {
    let mut body = response.body;
    let mut offset = 0u64;
    let mut client_alive = true;
    let mut abandoned_deadline: Option<tokio::time::Instant> = None;
    let mut completed = false;

    loop {
        let item = match abandoned_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, body.next()).await {
                Ok(item) => item,
                Err(_) => {
                    debug!(bytes = offset, "abandoned fetch timed out, keeping partial");
                    break;
                }
            },
            None => body.next().await,
        };

        let chunk = match item {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                // partial file intentionally left in place
                warn!(error = %err, bytes = offset, "origin stream failed mid-transfer");
                break;
            }
            None => {
                completed = true;
                break;
            }
        };

        if client_alive && client_tx.send(chunk.clone()).await.is_err() {
            client_alive = false;
            abandoned_deadline =
                Some(tokio::time::Instant::now() + abandoned_timeout);
            debug!(bytes = offset, "client disconnected, continuing fetch for cache");
        }

        if let Some(writer) = handle.as_mut() {
            if let Err(err) = writer.append(&chunk).await {
                warn!(error = %err, "disk write failed, degrading to pass-through");
                handle = None;
            }
        }

        let _ = data_tx.send(FlightChunk {
            offset,
            bytes: chunk.clone(),
        });
        offset += chunk.len() as u64;
    }

    if completed && may_complete {
        if let Some(writer) = handle.take() {
            if let Err(err) = writer.finish().await {
                warn!(error = %err, "finalizing cache entry failed");
            }
        }
    }
    // any other exit drops the handle: partial stays, writing mark released
}

struct ClientGone;

/// Streams `file[pos..EOF]` to the client; returns the new position.
async fn pump_file_from(
    store: &ChunkStore,
    key: &CacheKey,
    mut pos: u64,
    tx: &mpsc::Sender<Bytes>,
) -> Result<u64, ClientGone> {
    let Ok((mut file, _, _)) = store.open(key).await else {
        return Ok(pos);
    };
    if file.seek(SeekFrom::Start(pos)).await.is_err() {
        return Ok(pos);
    }
    let mut buf = vec![0u8; FILE_PUMP_BUF];
    loop {
        match file.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return Err(ClientGone);
                }
                pos += n as u64;
            }
        }
    }
    Ok(pos)
}

/// The follower's loop: disk back-fill, then live chunks deduplicated by
/// offset, re-syncing from disk on any gap or broadcast lag. Disk appends
/// happen before broadcasts, so the file always covers lost chunks.
async fn follower_pump(
    store: Arc<ChunkStore>,
    key: CacheKey,
    mut data_rx: broadcast::Receiver<FlightChunk>,
    tx: mpsc::Sender<Bytes>,
) {
    let mut pos = match pump_file_from(&store, &key, 0, &tx).await {
        Ok(pos) => pos,
        Err(ClientGone) => return,
    };

    loop {
        match data_rx.recv().await {
            Ok(chunk) => {
                let end = chunk.offset + chunk.bytes.len() as u64;
                if end <= pos {
                    continue;
                }
                if chunk.offset > pos {
                    // gap: missed chunks are already on disk
                    pos = match pump_file_from(&store, &key, pos, &tx).await {
                        Ok(pos) => pos,
                        Err(ClientGone) => return,
                    };
                    if chunk.offset > pos {
                        warn!("follower cannot bridge stream gap, truncating");
                        return;
                    }
                    if end <= pos {
                        continue;
                    }
                }
                let bytes = chunk.bytes.slice((pos - chunk.offset) as usize..);
                if tx.send(bytes).await.is_err() {
                    return;
                }
                pos = end;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "follower lagged, re-syncing from disk");
                pos = match pump_file_from(&store, &key, pos, &tx).await {
                    Ok(pos) => pos,
                    Err(ClientGone) => return,
                };
            }
            Err(broadcast::error::RecvError::Closed) => {
                // owner finished; pick up any tail that never reached us
                let _ = pump_file_from(&store, &key, pos, &tx).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn tee_mode_classification() {
        assert_eq!(tee_mode(&HeaderMap::new()), TeeMode::Full);
        assert_eq!(tee_mode(&headers_with_range("bytes=0-")), TeeMode::Full);
        assert_eq!(tee_mode(&headers_with_range("bytes=0-499")), TeeMode::Prefix);
        assert_eq!(tee_mode(&headers_with_range("bytes=500-999")), TeeMode::Off);
        assert_eq!(tee_mode(&headers_with_range("bytes=-500")), TeeMode::Off);
        assert_eq!(
            tee_mode(&headers_with_range("bytes=0-1,5-9")),
            TeeMode::Off
        );
    }

    #[test]
    fn origin_headers_drop_connection_headers() {
        let mut client = HeaderMap::new();
        client.insert(HOST, "127.0.0.1:9000".parse().unwrap());
        client.insert(CONTENT_LENGTH, "0".parse().unwrap());
        client.insert(RANGE, "bytes=0-".parse().unwrap());
        client.insert("x-playback-session", "abc".parse().unwrap());

        let forwarded = origin_headers(&client);
        assert!(forwarded.get(HOST).is_none());
        assert!(forwarded.get(CONTENT_LENGTH).is_none());
        assert_eq!(forwarded.get(RANGE).unwrap(), "bytes=0-");
        assert_eq!(forwarded.get("x-playback-session").unwrap(), "abc");
    }

    #[tokio::test]
    async fn registry_single_flights_per_key() {
        let registry = Arc::new(InflightRegistry::default());
        let key = CacheKey::from_url("https://cdn.example/v.mp4");

        let first = registry.admit(&key, false);
        assert!(matches!(first, Admission::Owner { .. }));
        assert!(matches!(
            registry.admit(&key, false),
            Admission::Follower(_)
        ));

        // a different key is its own flight
        let other = CacheKey::from_url("https://cdn.example/other.mp4");
        assert!(matches!(registry.admit(&other, false), Admission::Owner { .. }));

        // the guard releases the key on drop, on any exit path
        drop(first);
        assert!(matches!(registry.admit(&key, false), Admission::Owner { .. }));
    }
}
