use std::sync::Arc;

use futures_util::StreamExt;
use http::HeaderMap;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheKey, ChunkStore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::{Admission, FlightMeta, InflightRegistry, Origin};

/// Warms the cache with the head of a resource ahead of playback, bounded
/// to a byte cap so long videos are never fully pre-downloaded.
pub struct Prefetcher {
    store: Arc<ChunkStore>,
    origin: Arc<dyn Origin>,
    registry: Arc<InflightRegistry>,
    config: ProxyConfig,
}

impl Prefetcher {
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

    /// Downloads up to `max_bytes` of `url` into the cache. No-op when the
    /// resource is already cached or a download for it is in flight. The
    /// capped result is a bounded partial entry, exactly as if a relay had
    /// been interrupted; a resource shorter than the cap completes normally.
    pub async fn prefetch(&self, url: &str, max_bytes: Option<u64>) -> Result<u64> {
        let max_bytes = max_bytes.unwrap_or(self.config.default_prefetch_bytes);
        let target =
            Url::parse(url.trim()).map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
        let key = CacheKey::from_url(target.as_str());

        if self.store.exists(&key) {
            debug!(url, "prefetch skipped, already cached");
            return Ok(0);
        }

        let (guard, meta_tx, data_tx) = match self.registry.admit(&key, true) {
            Admission::Owner {
                guard,
                meta_tx,
                data_tx,
            } => (guard, meta_tx, data_tx),
            Admission::Follower(_) => {
                debug!(url, "prefetch skipped, download already in flight");
                return Ok(0);
            }
        };
        let _guard = guard;

        let response = self.origin.fetch(&target, &HeaderMap::new()).await?;
        if !response.status.is_success() {
            let _ = meta_tx.send(Some(FlightMeta::Failed {
                status: response.status,
            }));
            return Err(ProxyError::OriginStatus(response.status.as_u16()));
        }

        let mut handle = self
            .store
            .begin_write(&key, response.content_type.as_deref())
            .await?;
        let _ = meta_tx.send(Some(FlightMeta::ready_from(&response)));

        let mut body = response.body;
        let mut capped = false;
        while let Some(item) = body.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(url, error = %err, "prefetch stream failed, keeping partial");
                    return Ok(handle.bytes_written());
                }
            };
            let offset = handle.bytes_written();
            handle.append(&chunk).await.map_err(ProxyError::DiskWrite)?;
            let _ = data_tx.send(crate::proxy::FlightChunk::new(offset, chunk));
            if handle.bytes_written() >= max_bytes {
                capped = true;
                break;
            }
        }

        let written = handle.bytes_written();
        if capped {
            // drop without finish: a deliberate partial entry
            debug!(url, bytes = written, "prefetch reached cap");
            drop(handle);
        } else {
            handle.finish().await.map_err(ProxyError::DiskWrite)?;
            debug!(url, bytes = written, "prefetch completed resource");
        }
        Ok(written)
    }
}
