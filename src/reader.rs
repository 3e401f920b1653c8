//! Cache-aware stargz reading and prefetch.
//!
//! [`Reader`] wraps a parsed [`Stargz`] with a chunk cache. File reads go
//! chunk by chunk: each TOC-indexed chunk is served from the cache when an
//! entry of exactly the chunk's size is present, and otherwise decoded from
//! the underlying blob and inserted. The chunk is the unit of cache
//! residency even when the caller asked for a few bytes; random access
//! amortizes against that.
//!
//! Prefetch reads the leading prefix of the layer up to a landmark entry,
//! gunzips it, walks the tar and populates the cache with every file chunk
//! the prefix covers. Waiters rendezvous with the prefetcher through a
//! watch flag; a timed-out waiter force-clears the flag, releasing every
//! other waiter.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tokio::sync::watch;
use tracing::debug;

use crate::blob::BlobReader;
use crate::cache::{chunk_id, ChunkCache};
use crate::error::{Result, StoreError};
use crate::stargz::{Stargz, TocEntry, TocEntryType, TOC_TAR_NAME};

/// File entry whose TOC offset marks the end of the prefetch prefix.
pub const PREFETCH_LANDMARK: &str = ".prefetch.landmark";

/// File entry whose presence disables prefetch for the layer.
pub const NO_PREFETCH_LANDMARK: &str = ".no.prefetch.landmark";

/// Cache-aware reader over one stargz layer.
pub struct Reader {
    stargz: Arc<Stargz>,
    cache: Arc<dyn ChunkCache>,
    prefetch_started: AtomicBool,
    prefetch_flag: watch::Sender<bool>,
}

impl Reader {
    /// Parse the layer behind `reader` and return the reader together with
    /// the root TOC entry.
    pub async fn new(
        reader: Arc<dyn BlobReader>,
        cache: Arc<dyn ChunkCache>,
    ) -> Result<(Self, TocEntry)> {
        let stargz = Arc::new(Stargz::open(reader).await?);
        let root = stargz.root().clone();
        let (prefetch_flag, _) = watch::channel(false);
        Ok((
            Self {
                stargz,
                cache,
                prefetch_started: AtomicBool::new(false),
                prefetch_flag,
            },
            root,
        ))
    }

    /// The parsed layer.
    pub fn stargz(&self) -> &Arc<Stargz> {
        &self.stargz
    }

    /// Open a regular file for positional reads.
    pub fn open_file(&self, name: &str) -> Result<FileReader> {
        let entry = self
            .stargz
            .lookup(name)
            .ok_or_else(|| StoreError::NoSuchEntry(name.to_string()))?;
        if entry.entry_type != TocEntryType::Reg {
            return Err(StoreError::NoSuchEntry(name.to_string()));
        }
        Ok(FileReader {
            name: crate::stargz::clean_entry_name(name),
            digest: entry.digest.clone().unwrap_or_default(),
            size: entry.size,
            stargz: Arc::clone(&self.stargz),
            cache: Arc::clone(&self.cache),
        })
    }

    /// Warm the cache with the layer's leading prefix.
    ///
    /// The prefix length is `prefetch_size`, overridden by the
    /// `.prefetch.landmark` entry's offset when present and clamped to the
    /// layer size otherwise; `.no.prefetch.landmark` disables the whole
    /// pass. At most one prefetch runs per reader; later calls return
    /// immediately.
    pub async fn prefetch_with_reader(
        &self,
        section: &dyn BlobReader,
        prefetch_size: u64,
    ) -> Result<()> {
        if self.prefetch_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.prefetch_flag.send_replace(true);
        let result = self.prefetch(section, prefetch_size).await;
        self.prefetch_flag.send_replace(false);
        result
    }

    async fn prefetch(&self, section: &dyn BlobReader, mut prefetch_size: u64) -> Result<()> {
        if self.stargz.lookup(NO_PREFETCH_LANDMARK).is_some() {
            debug!("prefetch disabled by landmark");
            return Ok(());
        }
        if let Some(landmark) = self.stargz.lookup(PREFETCH_LANDMARK) {
            if landmark.offset > section.size() {
                return Err(StoreError::BadLandmark {
                    offset: landmark.offset,
                    size: section.size(),
                });
            }
            prefetch_size = landmark.offset;
        } else if prefetch_size > section.size() {
            prefetch_size = section.size();
        }

        let mut prefix = vec![0u8; prefetch_size as usize];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = section
                .read_at(&mut prefix[filled..], filled as u64)
                .await
                .map_err(|err| StoreError::PrefetchReadFailed(err.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        prefix.truncate(filled);

        let cached = self.cache_tar_gz(&prefix)?;
        debug!(prefix = filled, chunks = cached, "prefetch complete");
        Ok(())
    }

    /// Gunzip a leading slice of the layer, walk its tar entries and insert
    /// every file chunk the slice covers into the cache. Returns the number
    /// of chunks inserted. The slice intentionally truncates mid-archive,
    /// so running out of input is a terminator, not an error.
    pub fn cache_tar_gz(&self, data: &[u8]) -> Result<usize> {
        let mut cached = 0;
        match self.cache_tar_gz_inner(data, &mut cached) {
            // The tar walker reports a truncated archive as UnexpectedEof
            // or as an opaque "failed to read entire block" error.
            Err(StoreError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::Other
                ) =>
            {
                Ok(cached)
            }
            Err(err) => Err(err),
            Ok(()) => Ok(cached),
        }
    }

    fn cache_tar_gz_inner(&self, data: &[u8], cached: &mut usize) -> Result<()> {
        let decoder = MultiGzDecoder::new(data);
        let mut archive = tar::Archive::new(decoder);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let name = crate::stargz::clean_entry_name(&path);
            if name == PREFETCH_LANDMARK || name == NO_PREFETCH_LANDMARK || name == TOC_TAR_NAME {
                continue;
            }
            let entry_size = entry.header().size()?;
            if entry_size == 0 {
                continue;
            }
            let file_entry = self
                .stargz
                .lookup(&name)
                .ok_or_else(|| StoreError::NoSuchEntry(name.clone()))?;
            let digest = file_entry.digest.clone().unwrap_or_default();

            let mut consumed = 0u64;
            while consumed < entry_size {
                let Some(chunk) = self.stargz.chunk_entry_for_offset(&name, consumed) else {
                    break;
                };
                if consumed != chunk.chunk_offset {
                    return Err(StoreError::InvalidStargz(format!(
                        "chunk of {name:?} starts at {} but stream is at {consumed}",
                        chunk.chunk_offset
                    )));
                }

                let id = chunk_id(&digest, chunk.chunk_offset, chunk.chunk_size);
                let already_cached = self
                    .cache
                    .fetch(&id)
                    .map_or(false, |data| data.len() as u64 == chunk.chunk_size);

                // The tar stream has to be consumed either way to keep
                // later chunks aligned.
                let mut data = vec![0u8; chunk.chunk_size as usize];
                let read = read_full(&mut entry, &mut data)?;
                if read > 0 && read < data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated chunk in prefetch prefix",
                    )
                    .into());
                }
                if !already_cached {
                    self.cache.add(&id, data);
                    *cached += 1;
                }
                consumed += chunk.chunk_size;
            }
        }
        Ok(())
    }

    /// Block until a running prefetch completes.
    ///
    /// Returns immediately when no prefetch is in progress. After `timeout`
    /// the in-progress flag is force-cleared — releasing every other waiter
    /// — and [`StoreError::PrefetchTimeout`] is returned.
    pub async fn wait_for_prefetch_completion(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.prefetch_flag.subscribe();
        if !*receiver.borrow() {
            return Ok(());
        }
        let result = tokio::time::timeout(timeout, receiver.wait_for(|in_progress| !*in_progress))
            .await
            .is_ok();
        if result {
            Ok(())
        } else {
            self.prefetch_flag.send_replace(false);
            Err(StoreError::PrefetchTimeout { timeout })
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Positional reader over one regular file in the layer.
pub struct FileReader {
    name: String,
    digest: String,
    size: u64,
    stargz: Arc<Stargz>,
    cache: Arc<dyn ChunkCache>,
}

impl FileReader {
    /// Decompressed size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read bytes at `offset` into `buf`, chunk by chunk, preferring the
    /// cache. A short count past end of file is not an error.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(chunk) = self
                .stargz
                .chunk_entry_for_offset(&self.name, offset + filled as u64)
            else {
                break;
            };

            let id = chunk_id(&self.digest, chunk.chunk_offset, chunk.chunk_size);
            let data = match self.cache.fetch(&id) {
                Some(data) if data.len() as u64 == chunk.chunk_size => data,
                _ => {
                    let mut data = vec![0u8; chunk.chunk_size as usize];
                    self.stargz.read_chunk(&chunk, &mut data).await?;
                    self.cache.add(&id, data.clone());
                    data
                }
            };

            let skip = (offset + filled as u64 - chunk.chunk_offset) as usize;
            if skip >= data.len() {
                break;
            }
            let take = (buf.len() - filled).min(data.len() - skip);
            buf[filled..filled + take].copy_from_slice(&data[skip..skip + take]);
            filled += take;
        }
        Ok(filled)
    }
}
