mod chunk_store;
mod janitor;

pub use chunk_store::*;
pub use janitor::*;

use std::path::PathBuf;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use url::Url;

/// Content address of a cache entry: hex SHA-256 of the normalized source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_url(source_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_url(source_url).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable normalization so the same resource always hashes identically:
/// lowercased scheme/host, default port dropped, fragment stripped, query
/// order and content untouched. Unparseable inputs fall back to the trimmed
/// raw string.
fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.into()
        }
        Err(_) => trimmed.to_string(),
    }
}

/// Whether an entry is still being filled by a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Writing,
    Complete,
}

/// Snapshot of one on-disk entry, derived from a stat call plus the store's
/// live writing set. There is no index file to go stale.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: SystemTime,
    pub state: EntryState,
}
