use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ChunkStore, EntryState};
use crate::config::ProxyConfig;

/// What one cleaning pass removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanStats {
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Background policy engine keeping the store under its size ceiling and
/// free of stale entries. Eviction is least-recently-modified first, down to
/// a hysteresis target below the ceiling so passes don't thrash.
pub struct CacheJanitor {
    store: Arc<ChunkStore>,
    config: ProxyConfig,
}

impl CacheJanitor {
    pub fn new(store: Arc<ChunkStore>, config: ProxyConfig) -> Self {
        Self { store, config }
    }

    /// One deterministic pass: age expiry first, then size pressure.
    /// Entries still being written are never touched. A file vanishing
    /// mid-pass is a missed cycle for that file, not an error.
    pub async fn run_once(&self) -> CleanStats {
        let now = SystemTime::now();
        let mut entries = self.store.list_entries();
        let mut stats = CleanStats::default();

        entries.retain(|e| e.state != EntryState::Writing);

        // age-based expiry, independent of size pressure
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            let expired = now
                .duration_since(entry.modified_at)
                .map(|age| age > self.config.max_entry_age)
                .unwrap_or(false);
            if expired {
                match self.store.remove(&entry.key).await {
                    Ok(()) => {
                        debug!(key = entry.key.as_str(), "expired");
                        stats.removed += 1;
                        stats.bytes_freed += entry.size_bytes;
                    }
                    Err(err) => warn!(key = entry.key.as_str(), error = %err, "expiry skipped"),
                }
            } else {
                live.push(entry);
            }
        }

        // size pressure: oldest-modified first, down to the hysteresis target
        let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
        if total > self.config.max_cache_size {
            let target = self.config.evict_target();
            live.sort_by_key(|e| e.modified_at);
            for entry in &live {
                if total <= target {
                    break;
                }
                match self.store.remove(&entry.key).await {
                    Ok(()) => {
                        debug!(key = entry.key.as_str(), size = entry.size_bytes, "evicted");
                        total -= entry.size_bytes;
                        stats.removed += 1;
                        stats.bytes_freed += entry.size_bytes;
                    }
                    Err(err) => warn!(key = entry.key.as_str(), error = %err, "eviction skipped"),
                }
            }
        }

        if stats.removed > 0 {
            info!(
                removed = stats.removed,
                bytes_freed = stats.bytes_freed,
                "cache cleaned"
            );
        }
        stats
    }

    /// Runs `run_once` on the configured interval until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.clean_interval);
            // consume the immediate first tick; startup is not a cleaning event
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
