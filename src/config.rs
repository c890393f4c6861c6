use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the proxy and its cache store.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Root directory of the chunk store; created on startup if absent.
    pub cache_dir: PathBuf,
    /// Ceiling on the total size of the store.
    pub max_cache_size: u64,
    /// Eviction target as a fraction of `max_cache_size` (hysteresis band).
    pub evict_target_fraction: f64,
    /// Entries older than this are removed regardless of size pressure.
    pub max_entry_age: Duration,
    /// Minimum persisted size before an entry counts as playable.
    pub playable_threshold: u64,
    /// Default cap for `prefetch` when the caller does not pass one.
    pub default_prefetch_bytes: u64,
    /// Per-attempt timeout for origin requests.
    pub origin_timeout: Duration,
    /// Retries after a failed origin attempt.
    pub max_retries: u32,
    /// How long an origin fetch may keep filling the cache after its
    /// client disconnected.
    pub abandoned_timeout: Duration,
    /// Maximum concurrently served connections.
    pub max_connections: usize,
    /// Janitor schedule.
    pub clean_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("video_cache"),
            max_cache_size: 200 * 1024 * 1024,
            evict_target_fraction: 0.8,
            max_entry_age: Duration::from_secs(7 * 24 * 3600),
            playable_threshold: 1024 * 1024,
            default_prefetch_bytes: 3 * 1024 * 1024,
            origin_timeout: Duration::from_secs(10),
            max_retries: 3,
            abandoned_timeout: Duration::from_secs(30),
            max_connections: 100,
            clean_interval: Duration::from_secs(2 * 24 * 3600),
        }
    }
}

impl ProxyConfig {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_max_entry_age(mut self, age: Duration) -> Self {
        self.max_entry_age = age;
        self
    }

    pub fn with_playable_threshold(mut self, bytes: u64) -> Self {
        self.playable_threshold = bytes;
        self
    }

    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    /// Size the janitor shrinks the store to once the ceiling is crossed.
    pub fn evict_target(&self) -> u64 {
        (self.max_cache_size as f64 * self.evict_target_fraction) as u64
    }
}
