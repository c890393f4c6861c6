use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, EntryState};
use crate::error::{ProxyError, Result};

const CHUNK_EXT: &str = "chunk";
const META_EXT: &str = "meta";

/// Disk-backed key/value store for cached media bytes.
///
/// One `<hash>.chunk` file per key in a flat directory, with an optional
/// `<hash>.meta` sidecar holding the origin content type. Entry metadata
/// (size, mtime) comes from stat calls, so the store survives crashes
/// without a rebuildable index.
pub struct ChunkStore {
    root: PathBuf,
    playable_threshold: u64,
    writing: Arc<Mutex<HashSet<CacheKey>>>,
}

impl ChunkStore {
    pub async fn new(root: impl Into<PathBuf>, playable_threshold: u64) -> io::Result<Self> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).await?;
        }
        Ok(Self {
            root,
            playable_threshold,
            writing: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn playable_threshold(&self) -> u64 {
        self.playable_threshold
    }

    fn chunk_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str()).with_extension(CHUNK_EXT)
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str()).with_extension(META_EXT)
    }

    /// True iff a playable file exists for `key`: present, at or above the
    /// playability threshold, and not currently being written.
    pub fn exists(&self, key: &CacheKey) -> bool {
        if self.writing.lock().contains(key) {
            return false;
        }
        match std::fs::metadata(self.chunk_path(key)) {
            Ok(meta) => meta.len() >= self.playable_threshold,
            Err(_) => false,
        }
    }

    /// Opens the persisted file for reading, along with its length and the
    /// stored content type. Callers are expected to have checked `exists`;
    /// a miss here is a contract violation surfaced as `NotFound`.
    pub async fn open(&self, key: &CacheKey) -> Result<(File, u64, Option<String>)> {
        let path = self.chunk_path(key);
        let meta = fs::metadata(&path).await.map_err(|_| ProxyError::NotFound)?;
        let file = File::open(&path).await.map_err(|_| ProxyError::NotFound)?;
        let content_type = self.read_content_type(key).await;
        Ok((file, meta.len(), content_type))
    }

    pub async fn read_content_type(&self, key: &CacheKey) -> Option<String> {
        fs::read_to_string(self.meta_path(key)).await.ok()
    }

    /// Opens a truncating write handle for `key`. At most one writer may hold
    /// a given key; a second caller gets `AlreadyWriting`. Any previous
    /// partial file for the key is discarded (downloads restart from byte
    /// zero rather than resuming).
    pub async fn begin_write(
        &self,
        key: &CacheKey,
        content_type: Option<&str>,
    ) -> Result<WriteHandle> {
        if !self.writing.lock().insert(key.clone()) {
            return Err(ProxyError::AlreadyWriting);
        }

        let path = self.chunk_path(key);
        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                self.writing.lock().remove(key);
                return Err(ProxyError::DiskWrite(err));
            }
        };

        if let Some(ct) = content_type {
            if let Err(err) = fs::write(self.meta_path(key), ct).await {
                warn!(key = key.as_str(), error = %err, "failed to persist content type");
            }
        }

        debug!(key = key.as_str(), "begin write");
        Ok(WriteHandle {
            key: key.clone(),
            file: Some(file),
            bytes_written: 0,
            writing: Arc::clone(&self.writing),
        })
    }

    pub async fn remove(&self, key: &CacheKey) -> io::Result<()> {
        fs::remove_file(self.chunk_path(key)).await?;
        // sidecar is best-effort; the data file is the entry
        let _ = fs::remove_file(self.meta_path(key)).await;
        Ok(())
    }

    pub fn size_on_disk(&self) -> u64 {
        self.list_entries().iter().map(|e| e.size_bytes).sum()
    }

    /// Stat-derived snapshot of every entry in the store. Files that vanish
    /// mid-enumeration are skipped; foreign files and sidecars are ignored.
    pub fn list_entries(&self) -> Vec<CacheEntry> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "cache directory unreadable");
                return Vec::new();
            }
        };

        let writing = self.writing.lock().clone();
        let mut entries = Vec::new();
        for item in dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(meta) = item.metadata() else {
                continue;
            };
            let key = CacheKey::from_hash(stem);
            let state = if writing.contains(&key) {
                EntryState::Writing
            } else {
                EntryState::Complete
            };
            entries.push(CacheEntry {
                key,
                file_path: path,
                size_bytes: meta.len(),
                modified_at: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                state,
            });
        }
        entries
    }

    /// Picks a random playable entry, optionally restricted to entries whose
    /// stored content type is `video/*`. Used for instant-splash screens.
    pub async fn random_playable(&self, video_only: bool) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        for entry in self.list_entries() {
            if entry.state != EntryState::Complete || entry.size_bytes < self.playable_threshold {
                continue;
            }
            if video_only {
                match self.read_content_type(&entry.key).await {
                    Some(ct) if ct.starts_with("video/") => {}
                    _ => continue,
                }
            }
            candidates.push(entry.file_path);
        }
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

impl CacheKey {
    /// Rehydrates a key from an on-disk file stem.
    pub(crate) fn from_hash(hash: &str) -> Self {
        Self(hash.to_string())
    }
}

/// Exclusive append handle for one cache entry.
///
/// Must be `finish`ed to mark the entry complete; dropping it early releases
/// the writing mark but leaves whatever bytes were appended on disk as a
/// partial entry.
pub struct WriteHandle {
    key: CacheKey,
    file: Option<File>,
    bytes_written: u64,
    writing: Arc<Mutex<HashSet<CacheKey>>>,
}

impl WriteHandle {
    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "write handle closed"))?;
        file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Flushes and marks the entry complete.
    pub async fn finish(mut self) -> io::Result<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        debug!(key = self.key.as_str(), bytes = self.bytes_written, "write complete");
        Ok(self.bytes_written)
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        self.writing.lock().remove(&self.key);
    }
}
