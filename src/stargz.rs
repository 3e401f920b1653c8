//! Stargz archive access: footer, table of contents, chunk decoding.
//!
//! A stargz blob is a valid gzipped tar whose members are flushed at chunk
//! boundaries, followed by a TOC (a tar entry named `stargz.index.json`
//! inside its own gzip member) and a fixed-size footer recording where the
//! TOC starts. Because every file chunk begins at a gzip member boundary,
//! a chunk can be decompressed from the raw blob without touching anything
//! before it.
//!
//! This module parses the footer and TOC, indexes chunk locations per file,
//! and decodes individual chunks through any [`BlobReader`]. Cache-aware
//! reading and prefetch live in [`crate::reader`].
//!
//! # TOC structure
//!
//! The TOC is a JSON document:
//! ```json
//! {
//!   "version": 1,
//!   "entries": [
//!     { "name": "usr/bin/app", "type": "reg", "size": 123456,
//!       "digest": "sha256:...", "offset": 512,
//!       "chunkOffset": 0, "chunkSize": 49152 },
//!     { "name": "usr/bin/app", "type": "chunk",
//!       "offset": 35000, "chunkOffset": 49152, "chunkSize": 49152 }
//!   ]
//! }
//! ```
//!
//! A regular-file entry describes the file and, implicitly, its first
//! chunk; continuation chunks follow as `chunk` entries. `chunkSize` of
//! zero on a regular file means the whole file is a single chunk.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::blob::BlobReader;
use crate::error::{Result, StoreError};

/// Name of the TOC entry inside the archive.
pub const TOC_TAR_NAME: &str = "stargz.index.json";

/// Size of the stargz footer in bytes.
pub const FOOTER_SIZE: u64 = 47;

const FOOTER_EXTRA_LEN: usize = 22;
const FOOTER_MAGIC: &[u8] = b"STARGZ";

/// Type of a TOC entry, matching the stargz on-disk names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TocEntryType {
    /// Regular file
    Reg,
    /// Directory
    Dir,
    /// Symbolic link
    Symlink,
    /// Hard link
    Hardlink,
    /// Character device
    Char,
    /// Block device
    Block,
    /// FIFO (named pipe)
    Fifo,
    /// Continuation chunk of a regular file
    Chunk,
}

/// A single entry in the TOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    /// Complete path in the layer, without leading `./` or `/`.
    pub name: String,

    /// Type of this entry.
    #[serde(rename = "type")]
    pub entry_type: TocEntryType,

    /// Uncompressed size for regular files.
    #[serde(default)]
    pub size: u64,

    /// Modification time in RFC3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modtime: Option<String>,

    /// Link target for symlinks and hardlinks.
    #[serde(rename = "linkName", default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,

    /// Permission and mode bits.
    #[serde(default)]
    pub mode: u32,

    /// User ID of the owner.
    #[serde(default)]
    pub uid: u32,

    /// Group ID of the owner.
    #[serde(default)]
    pub gid: u32,

    /// Username of the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uname: Option<String>,

    /// Group name of the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gname: Option<String>,

    /// Major device number for char/block devices.
    #[serde(rename = "devMajor", default)]
    pub dev_major: u32,

    /// Minor device number for char/block devices.
    #[serde(rename = "devMinor", default)]
    pub dev_minor: u32,

    /// Extended attributes, base64-encoded values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<HashMap<String, String>>,

    /// Digest of the whole decompressed file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Offset in the compressed blob where this entry's data begins.
    #[serde(default)]
    pub offset: u64,

    /// Offset of this chunk within the decompressed file.
    #[serde(rename = "chunkOffset", default)]
    pub chunk_offset: u64,

    /// Size of this chunk in decompressed bytes.
    #[serde(rename = "chunkSize", default)]
    pub chunk_size: u64,
}

/// The TOC document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toc {
    /// Version of the TOC format (currently 1).
    pub version: u32,

    /// All entries in the layer.
    pub entries: Vec<TocEntry>,
}

/// Location of one chunk of a file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEntry {
    /// Offset in the compressed blob where the chunk's gzip member begins.
    pub offset: u64,

    /// Offset in the compressed blob where the next member begins; bounds
    /// the compressed window this chunk can be decoded from.
    pub next_offset: u64,

    /// Offset of the chunk within the decompressed file.
    pub chunk_offset: u64,

    /// Decompressed size of the chunk.
    pub chunk_size: u64,
}

/// Parsed stargz layer: TOC index over a positional reader of the
/// compressed blob.
pub struct Stargz {
    reader: Arc<dyn BlobReader>,
    size: u64,
    toc_offset: u64,
    entries: HashMap<String, TocEntry>,
    chunks: HashMap<String, Vec<ChunkEntry>>,
    root: TocEntry,
}

impl Stargz {
    /// Parse the footer and TOC of the blob behind `reader`.
    pub async fn open(reader: Arc<dyn BlobReader>) -> Result<Self> {
        let size = reader.size();
        if size < FOOTER_SIZE {
            return Err(StoreError::InvalidStargz(format!(
                "blob of {size} bytes is smaller than the stargz footer"
            )));
        }

        let mut footer = vec![0u8; FOOTER_SIZE as usize];
        let n = reader.read_at(&mut footer, size - FOOTER_SIZE).await?;
        if n as u64 != FOOTER_SIZE {
            return Err(StoreError::InvalidStargz("short footer read".to_string()));
        }
        let toc_offset = parse_footer(&footer)?;
        if toc_offset >= size - FOOTER_SIZE {
            return Err(StoreError::InvalidStargz(format!(
                "TOC offset {toc_offset} out of range for blob of {size} bytes"
            )));
        }

        let toc_len = (size - FOOTER_SIZE - toc_offset) as usize;
        let mut toc_raw = vec![0u8; toc_len];
        let n = reader.read_at(&mut toc_raw, toc_offset).await?;
        if n != toc_len {
            return Err(StoreError::InvalidStargz("short TOC read".to_string()));
        }
        let toc = parse_toc(&toc_raw)?;

        let mut entries = HashMap::new();
        let mut chunks: HashMap<String, Vec<ChunkEntry>> = HashMap::new();
        let mut data_offsets = Vec::new();

        for entry in &toc.entries {
            let name = clean_entry_name(&entry.name);
            match entry.entry_type {
                TocEntryType::Chunk => {
                    data_offsets.push(entry.offset);
                    chunks.entry(name).or_default().push(ChunkEntry {
                        offset: entry.offset,
                        next_offset: 0,
                        chunk_offset: entry.chunk_offset,
                        chunk_size: entry.chunk_size,
                    });
                }
                entry_type => {
                    if entry_type == TocEntryType::Reg && entry.size > 0 {
                        data_offsets.push(entry.offset);
                        let first_chunk_size = if entry.chunk_size == 0 {
                            entry.size
                        } else {
                            entry.chunk_size
                        };
                        chunks.entry(name.clone()).or_default().push(ChunkEntry {
                            offset: entry.offset,
                            next_offset: 0,
                            chunk_offset: 0,
                            chunk_size: first_chunk_size,
                        });
                    }
                    entries.insert(name, entry.clone());
                }
            }
        }

        data_offsets.push(toc_offset);
        data_offsets.sort_unstable();
        data_offsets.dedup();
        for list in chunks.values_mut() {
            for chunk in list.iter_mut() {
                let next = data_offsets.partition_point(|&o| o <= chunk.offset);
                chunk.next_offset = data_offsets.get(next).copied().unwrap_or(toc_offset);
            }
            list.sort_by_key(|chunk| chunk.chunk_offset);
        }

        let root = entries.get("").cloned().unwrap_or_else(synthetic_root);
        entries.entry(String::new()).or_insert_with(|| root.clone());

        Ok(Self {
            reader,
            size,
            toc_offset,
            entries,
            chunks,
            root,
        })
    }

    /// Size of the compressed blob.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset where the TOC's gzip member begins.
    pub fn toc_offset(&self) -> u64 {
        self.toc_offset
    }

    /// The root directory entry.
    pub fn root(&self) -> &TocEntry {
        &self.root
    }

    /// Look up a TOC entry by path.
    pub fn lookup(&self, name: &str) -> Option<&TocEntry> {
        self.entries.get(&clean_entry_name(name))
    }

    /// Find the chunk of `name` covering the decompressed `offset`.
    pub fn chunk_entry_for_offset(&self, name: &str, offset: u64) -> Option<ChunkEntry> {
        let list = self.chunks.get(&clean_entry_name(name))?;
        list.iter()
            .find(|chunk| {
                chunk.chunk_offset <= offset && offset < chunk.chunk_offset + chunk.chunk_size
            })
            .copied()
    }

    /// Decode one chunk into `buf` (at most `chunk.chunk_size` bytes),
    /// returning the number of bytes produced. A short count means the
    /// compressed stream ended early; that is the caller's business.
    pub async fn read_chunk(&self, chunk: &ChunkEntry, buf: &mut [u8]) -> Result<usize> {
        let window = (chunk.next_offset.saturating_sub(chunk.offset)) as usize;
        let mut compressed = vec![0u8; window];
        let n = self.reader.read_at(&mut compressed, chunk.offset).await?;
        compressed.truncate(n);

        let mut decoder = GzDecoder::new(&compressed[..]);
        let limit = buf.len().min(chunk.chunk_size as usize);
        let mut produced = 0;
        while produced < limit {
            match decoder.read(&mut buf[produced..limit]) {
                Ok(0) => break,
                Ok(read) => produced += read,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(produced)
    }
}

fn synthetic_root() -> TocEntry {
    TocEntry {
        name: String::new(),
        entry_type: TocEntryType::Dir,
        size: 0,
        modtime: None,
        link_name: None,
        mode: 0o755,
        uid: 0,
        gid: 0,
        uname: None,
        gname: None,
        dev_major: 0,
        dev_minor: 0,
        xattrs: None,
        digest: None,
        offset: 0,
        chunk_offset: 0,
        chunk_size: 0,
    }
}

/// Normalize a TOC or tar path for lookup.
pub(crate) fn clean_entry_name(name: &str) -> String {
    name.trim_start_matches("./").trim_end_matches('/').to_string()
}

/// Parse the 47-byte stargz footer: an empty gzip member whose FEXTRA
/// field holds the TOC offset as 16 hex digits followed by `STARGZ`.
fn parse_footer(footer: &[u8]) -> Result<u64> {
    let invalid = |reason: &str| StoreError::InvalidStargz(format!("footer: {reason}"));

    if footer.len() != FOOTER_SIZE as usize {
        return Err(invalid("wrong length"));
    }
    if footer[0] != 0x1f || footer[1] != 0x8b {
        return Err(invalid("not a gzip member"));
    }
    if footer[3] & 0x04 == 0 {
        return Err(invalid("missing extra field"));
    }
    let xlen = u16::from_le_bytes([footer[10], footer[11]]) as usize;
    if xlen != FOOTER_EXTRA_LEN {
        return Err(invalid("unexpected extra field length"));
    }
    let extra = &footer[12..12 + FOOTER_EXTRA_LEN];
    if &extra[16..] != FOOTER_MAGIC {
        return Err(invalid("missing STARGZ magic"));
    }
    let hex_offset =
        std::str::from_utf8(&extra[..16]).map_err(|_| invalid("non-ASCII TOC offset"))?;
    u64::from_str_radix(hex_offset, 16).map_err(|_| invalid("unparseable TOC offset"))
}

/// Decode the TOC member: a gzipped tar holding `stargz.index.json`.
fn parse_toc(raw: &[u8]) -> Result<Toc> {
    let decoder = GzDecoder::new(raw);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_toc = entry
            .path()
            .ok()
            .map(|p| p.to_string_lossy() == TOC_TAR_NAME)
            .unwrap_or(false);
        if is_toc {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            return Ok(serde_json::from_slice(&json)?);
        }
    }
    Err(StoreError::InvalidStargz(format!(
        "{TOC_TAR_NAME} not found in TOC member"
    )))
}
