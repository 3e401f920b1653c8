#![forbid(unsafe_code)]
//! Lazy, range-addressable access to stargz container image layers.
//!
//! A stargz layer is a seekable gzip archive: gzip members are flushed at
//! chunk boundaries and a table of contents (TOC) appended to the blob maps
//! file paths and offsets to those members. That makes random access to
//! individual files — and to fixed-size chunks within files — possible
//! without downloading the whole layer.
//!
//! This library provides the pieces needed to read such layers lazily from
//! an OCI-compatible registry:
//!
//! - **Resolution**: [`Resolver`] walks the configured mirrors for an image
//!   reference, negotiates authenticated transport, follows the blob
//!   endpoint's redirect, and returns a size-checked [`Blob`] handle.
//! - **Range fetching**: blob reads are chunk-aligned and service all cache
//!   misses of a read in a single HTTP request using a
//!   `multipart/byteranges` response.
//! - **Layer reading**: [`Reader`] maps `(path, offset)` to TOC chunks and
//!   serves positional file reads through a content-addressed
//!   [`ChunkCache`], fetching only the chunks it misses.
//! - **Prefetch**: the leading prefix of a layer (bounded by landmark
//!   entries) is fetched eagerly, unpacked in memory and used to warm the
//!   cache, with a completion signal for concurrent readers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stargz_store::{
//!     AnonymousKeychain, BlobConfig, MemoryCache, Reader, Resolver, SectionReader,
//! };
//!
//! # async fn example() -> stargz_store::Result<()> {
//! let resolver = Resolver::new(Arc::new(AnonymousKeychain), Default::default())?;
//! let cache = Arc::new(MemoryCache::default());
//!
//! let blob = resolver
//!     .resolve(
//!         "registry.example.com/ns/app:v1",
//!         "sha256:0000000000000000000000000000000000000000000000000000000000000000",
//!         cache.clone(),
//!         &BlobConfig::default(),
//!     )
//!     .await?;
//!
//! let section = Arc::new(SectionReader::whole(Arc::new(blob)));
//! let (reader, _root) = Reader::new(section, cache).await?;
//!
//! let file = reader.open_file("etc/passwd")?;
//! let mut buf = vec![0u8; 128];
//! let n = file.read_at(&mut buf, 0).await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```
//!
//! The tar and gzip primitives come from the `tar` and `flate2` crates; the
//! stargz TOC, footer and chunk indexing live in [`stargz`]. FUSE wiring,
//! snapshotter lifecycle and configuration loading are the embedding
//! application's business.

// Remote access
pub mod blob;
pub mod fetcher;
pub mod keychain;
pub mod reference;
pub mod region;
pub mod resolver;

// Layer access
pub mod reader;
pub mod stargz;

// Shared infrastructure
pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use blob::{Blob, BlobReader, SectionReader};
pub use cache::{chunk_id, ChunkCache, DirectoryCache, MemoryCache, UnboundedCache};
pub use config::{BlobConfig, Config, MirrorConfig, ResolverConfig};
pub use error::{Result, StoreError};
pub use fetcher::FetchOptions;
pub use keychain::{AnonymousKeychain, AuthTransport, Credential, Keychain, StaticKeychain};
pub use reader::{FileReader, Reader, NO_PREFETCH_LANDMARK, PREFETCH_LANDMARK};
pub use reference::Reference;
pub use region::{parse_content_range, Region};
pub use resolver::{Resolver, DEFAULT_CHUNK_SIZE, DEFAULT_VALID_INTERVAL};
pub use stargz::{ChunkEntry, Stargz, Toc, TocEntry, TocEntryType, FOOTER_SIZE, TOC_TAR_NAME};
