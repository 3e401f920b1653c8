//! Content-addressed chunk cache.
//!
//! The reader and the blob fetch path both store fixed-size chunks under a
//! hex SHA-256 chunk ID. The [`ChunkCache`] trait captures the contract the
//! rest of the library depends on; eviction, persistence and size limits
//! are the implementation's own business.
//!
//! Two implementations are provided:
//!
//! - [`MemoryCache`]: an entry-count-bounded LRU held in memory.
//! - [`DirectoryCache`]: one file per chunk under a fan-out directory,
//!   written atomically via a temp file and rename.
//!
//! Callers must treat entries whose length differs from the expected chunk
//! size as absent; the cache itself stores whatever it is given.

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;

/// Default entry-count bound for [`MemoryCache`].
pub const DEFAULT_MEMORY_CACHE_ENTRIES: usize = 4096;

/// Compute a chunk ID: the hex SHA-256 digest of `"{key}-{offset}-{size}"`.
///
/// The reader path keys by file digest and decompressed chunk coordinates;
/// the raw-fetch path keys by blob URL and region bounds. The two key
/// families hash into the same digest space but never share a `key` string.
pub fn chunk_id(key: &str, offset: u64, size: u64) -> String {
    hex::encode(Sha256::digest(format!("{key}-{offset}-{size}").as_bytes()))
}

/// Store mapping a chunk ID to its bytes.
///
/// `fetch` and `add` must be safe under concurrent callers. `add` is
/// idempotent; replacing an entry under the same ID is permitted
/// (last-writer-wins).
pub trait ChunkCache: Send + Sync {
    /// Look up a chunk. `None` means a miss.
    fn fetch(&self, id: &str) -> Option<Vec<u8>>;

    /// Insert (or replace) a chunk.
    fn add(&self, id: &str, data: Vec<u8>);
}

/// In-memory LRU chunk cache bounded by entry count.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_entries` chunks.
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CACHE_ENTRIES)
    }
}

impl ChunkCache for MemoryCache {
    fn fetch(&self, id: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().ok()?;
        entries.get(id).cloned()
    }

    fn add(&self, id: &str, data: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(id.to_string(), data);
        }
    }
}

/// Filesystem chunk cache: one file per chunk ID under a two-character
/// fan-out directory.
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    /// Open (creating if needed) a directory cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        if id.len() >= 2 {
            self.root.join(&id[..2]).join(id)
        } else {
            self.root.join(id)
        }
    }
}

impl ChunkCache for DirectoryCache {
    fn fetch(&self, id: &str) -> Option<Vec<u8>> {
        fs::read(self.entry_path(id)).ok()
    }

    fn add(&self, id: &str, data: Vec<u8>) {
        // Cache writes are best effort; a failure only costs a re-fetch.
        let path = self.entry_path(id);
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &data)?;
            fs::rename(&tmp, &path)
        })();
        if let Err(err) = result {
            warn!(id, error = %err, "failed to persist chunk");
        }
    }
}

/// Unbounded in-memory cache, mainly useful in tests and for prefetch
/// experiments where eviction would defeat the purpose.
#[derive(Default)]
pub struct UnboundedCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl UnboundedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkCache for UnboundedCache {
    fn fetch(&self, id: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(id).cloned()
    }

    fn add(&self, id: &str, data: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.to_string(), data);
        }
    }
}
