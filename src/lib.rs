//! On-device video caching proxy.
//!
//! A loopback HTTP server that sits between a video player and the network:
//! media requests routed through it are streamed from the origin while being
//! teed to a disk store, HLS playlists are rewritten so every segment and
//! sub-playlist also flows through the proxy, and a background janitor keeps
//! the store within size and age bounds.

pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;

pub use cache::{CacheEntry, CacheJanitor, CacheKey, ChunkStore, CleanStats, EntryState};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::{ProxyServer, BINARY_ROUTE, MANIFEST_ROUTE};
