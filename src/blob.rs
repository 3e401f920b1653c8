//! Remote blob handle with chunk-aligned cached reads.
//!
//! A [`Blob`] is produced by the resolver: a size-checked handle over one
//! layer blob on whichever mirror won the resolve walk. Reads are split
//! into fixed-size regions aligned to the blob's chunk size; each region is
//! served from the chunk cache when present and otherwise fetched — all
//! misses of one read in a single multipart request — then cached under the
//! fetcher's raw-range ID.
//!
//! The fetcher inside the handle can be swapped by a refresh; readers
//! snapshot it under the per-blob lock and perform I/O outside the lock.
//! When the liveness window has lapsed, the next read probes the URL
//! first; an unhealthy probe re-resolves the fetcher through the owning
//! resolver and the read continues against whichever mirror won, so a
//! rotated URL or restarted mirror heals without surfacing an error.
//!
//! [`SectionReader`] carves a sub-range view out of a blob; it is the seam
//! the stargz reader consumes, and `Vec<u8>` implements the same trait so
//! tests and prefetch plumbing can run against in-memory layers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::ChunkCache;
use crate::error::{Result, StoreError};
use crate::fetcher::{FetchOptions, Fetcher};
use crate::region::Region;
use crate::resolver::Resolver;

/// Positional reader over some byte source.
///
/// `read_at` fills as much of `buf` as the source can provide at `offset`
/// and returns the number of bytes written; a short count signals the end
/// of the source, never an error.
#[async_trait]
pub trait BlobReader: Send + Sync {
    /// Read bytes at `offset` into `buf`.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;
}

#[async_trait]
impl BlobReader for Vec<u8> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

struct FetcherSlot {
    fetcher: Arc<Fetcher>,
    last_check: Instant,
}

/// Handle to a resolved remote blob.
pub struct Blob {
    resolver: Resolver,
    reference: String,
    digest: String,
    slot: Mutex<FetcherSlot>,
    size: u64,
    chunk_size: u64,
    check_interval: Duration,
    cache: Arc<dyn ChunkCache>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("reference", &self.reference)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl Blob {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        resolver: Resolver,
        reference: String,
        digest: String,
        fetcher: Fetcher,
        size: u64,
        chunk_size: u64,
        check_interval: Duration,
        cache: Arc<dyn ChunkCache>,
    ) -> Self {
        Self {
            resolver,
            reference,
            digest,
            slot: Mutex::new(FetcherSlot {
                fetcher: Arc::new(fetcher),
                last_check: Instant::now(),
            }),
            size,
            chunk_size,
            check_interval,
            cache,
        }
    }

    /// Blob size as recorded at resolve time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fetch granularity in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// URL the current fetcher is bound to.
    pub async fn fetcher_url(&self) -> String {
        self.slot.lock().await.fetcher.url.clone()
    }

    /// Force a liveness probe of the current fetcher, updating the check
    /// window on success.
    pub async fn check(&self) -> Result<()> {
        let fetcher = {
            let slot = self.slot.lock().await;
            Arc::clone(&slot.fetcher)
        };
        fetcher.check().await?;
        self.slot.lock().await.last_check = Instant::now();
        Ok(())
    }

    pub(crate) async fn refresh_fetcher(&self) -> Result<()> {
        // The slot lock serializes concurrent refreshes.
        let mut slot = self.slot.lock().await;
        let (fetcher, new_size) = self
            .resolver
            .resolve_fetcher(&self.reference, &self.digest)
            .await?;
        if new_size != self.size {
            return Err(StoreError::SizeChanged {
                expected: self.size,
                actual: new_size,
            });
        }
        slot.fetcher = Arc::new(fetcher);
        slot.last_check = Instant::now();
        Ok(())
    }

    /// Current fetcher, probing and re-resolving first when the liveness
    /// window has lapsed. An unhealthy probe triggers a refresh and the
    /// freshly installed fetcher is returned; only a failed re-resolve
    /// surfaces an error.
    async fn snapshot_fetcher(&self) -> Result<Arc<Fetcher>> {
        let (fetcher, stale) = {
            let slot = self.slot.lock().await;
            (
                Arc::clone(&slot.fetcher),
                slot.last_check.elapsed() >= self.check_interval,
            )
        };
        if !stale {
            return Ok(fetcher);
        }
        match fetcher.check().await {
            Ok(()) => {
                self.slot.lock().await.last_check = Instant::now();
                Ok(fetcher)
            }
            Err(err) => {
                warn!(error = %err, "blob liveness check failed; refreshing fetcher");
                self.refresh_fetcher().await?;
                Ok(Arc::clone(&self.slot.lock().await.fetcher))
            }
        }
    }

    /// Read bytes at `offset` into `buf` with default fetch options.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_at_with(buf, offset, &FetchOptions::default())
            .await
    }

    /// Read bytes at `offset` into `buf`, overriding fetch options.
    pub async fn read_at_with(
        &self,
        buf: &mut [u8],
        offset: u64,
        options: &FetchOptions,
    ) -> Result<usize> {
        if buf.is_empty() || self.size == 0 || offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);

        let fetcher = self.snapshot_fetcher().await?;

        let first = offset / self.chunk_size;
        let last = (offset + want as u64 - 1) / self.chunk_size;
        let mut regions = Vec::with_capacity((last - first + 1) as usize);
        for index in first..=last {
            let begin = index * self.chunk_size;
            let end = (begin + self.chunk_size - 1).min(self.size - 1);
            regions.push(Region::new(begin, end));
        }

        let mut chunks: HashMap<Region, Vec<u8>> = HashMap::new();
        let mut missing = Vec::new();
        for region in &regions {
            match self.cache.fetch(&fetcher.gen_id(*region)) {
                Some(data) if data.len() as u64 == region.size() => {
                    chunks.insert(*region, data);
                }
                _ => missing.push(*region),
            }
        }

        if !missing.is_empty() {
            let fetched = fetcher.fetch(&missing, options).await?;
            for miss in &missing {
                let piece = fetched.iter().find_map(|(got, data)| {
                    got.contains(miss).then(|| {
                        let start = (miss.begin - got.begin) as usize;
                        data[start..start + miss.size() as usize].to_vec()
                    })
                });
                let piece = piece.ok_or(StoreError::IncompleteFetch { region: *miss })?;
                self.cache.add(&fetcher.gen_id(*miss), piece.clone());
                chunks.insert(*miss, piece);
            }
        }

        let mut written = 0;
        for region in &regions {
            let data = &chunks[region];
            let skip = offset.saturating_sub(region.begin) as usize;
            let take = (want - written).min(data.len() - skip);
            buf[written..written + take].copy_from_slice(&data[skip..skip + take]);
            written += take;
        }
        Ok(written)
    }
}

/// A `[base, base + length)` view over a blob.
pub struct SectionReader {
    blob: Arc<Blob>,
    base: u64,
    length: u64,
}

impl SectionReader {
    /// Create a view over `[base, base + length)`, clamped to the blob.
    pub fn new(blob: Arc<Blob>, base: u64, length: u64) -> Self {
        let length = length.min(blob.size().saturating_sub(base));
        Self { blob, base, length }
    }

    /// View covering the entire blob.
    pub fn whole(blob: Arc<Blob>) -> Self {
        let length = blob.size();
        Self {
            blob,
            base: 0,
            length,
        }
    }
}

#[async_trait]
impl BlobReader for SectionReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let n = buf.len().min((self.length - offset) as usize);
        self.blob.read_at(&mut buf[..n], self.base + offset).await
    }

    fn size(&self) -> u64 {
        self.length
    }
}
