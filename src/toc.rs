//! Table of Contents (TOC) for eStargz layer blobs.
//!
//! Every eStargz blob carries a gzipped tar section near its tail containing
//! a single JSON document, `stargz.index.json`, that lists every entry in the
//! layer together with the blob offsets of the gzip members holding its
//! content. This module decodes that section and derives per-file *chunk
//! plans*: the minimal set of ranged reads needed to reassemble one file.
//!
//! # Example
//!
//! ```no_run
//! use stargz_fetch::toc::{parse_toc, chunks_for_file};
//!
//! let toc_section: Vec<u8> = Vec::new(); // bytes of [toc_start, blob_size)
//! let toc = parse_toc(&toc_section)?;
//! let metadata = chunks_for_file(&toc, "usr/bin/bash")?;
//! for chunk in &metadata.chunks {
//!     println!("{} bytes at blob offset {}", chunk.size, chunk.compressed_offset);
//! }
//! # Ok::<(), stargz_fetch::StargzError>(())
//! ```

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::{BoxedError, Result, StargzError};

/// Name of the TOC entry inside the gzipped tar section.
pub const TOC_TAR_NAME: &str = "stargz.index.json";

/// Decoded representation of `stargz.index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toc {
    /// Version of the TOC format (currently 1).
    pub version: i32,

    /// All entries in the layer, in writer order.
    #[serde(default)]
    pub entries: Vec<TocEntry>,
}

/// Type of a TOC entry.
///
/// The wire values are the lowercase strings the eStargz writer emits. Only
/// `reg` and `chunk` point at fetchable bytes: `reg` opens a regular file
/// (and carries its logical size), `chunk` continues one under the same
/// `name`. The remaining types describe filesystem structure that downloads
/// never materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TocEntryType {
    /// First (or only) entry of a regular file.
    Reg,
    /// Continuation of a multi-chunk regular file.
    Chunk,
    /// Directory entry.
    Dir,
    /// Symbolic link; listed but never downloaded.
    Symlink,
    /// Hard link to another entry in the layer.
    Hardlink,
    /// Character device node.
    Char,
    /// Block device node.
    Block,
    /// Named pipe.
    Fifo,
    /// Any type this implementation does not know; tolerated and skipped.
    #[serde(other)]
    Unknown,
}

/// A single entry in the TOC.
///
/// Field names mirror the JSON keys emitted by the eStargz writer; unknown
/// keys are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    /// Complete path in the layer, without a leading slash.
    pub name: String,

    /// Type of this entry.
    #[serde(rename = "type")]
    pub entry_type: TocEntryType,

    /// Logical file size; populated on `reg` entries.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    /// Absolute blob offset where this entry's gzip member starts.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,

    /// Logical offset within the file covered by this entry.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,

    /// Logical bytes covered; 0 means "infer" (see [`chunks_for_file`]).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_size: u64,

    /// Decoded bytes to discard after opening this gzip member before the
    /// chunk's data begins.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub inner_offset: u64,

    /// Digest of this chunk's decoded bytes, when the writer recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_digest: Option<String>,

    /// Arbitrary writer annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl TocEntry {
    /// Minimal constructor used by tests and synthetic-blob builders.
    pub fn new(name: impl Into<String>, entry_type: TocEntryType) -> Self {
        TocEntry {
            name: name.into(),
            entry_type,
            size: 0,
            offset: 0,
            chunk_offset: 0,
            chunk_size: 0,
            inner_offset: 0,
            chunk_digest: None,
            annotations: None,
        }
    }
}

/// A logical tile of one file, fetchable and decodable independently.
///
/// Seek the blob to `compressed_offset`, start a fresh gzip decoder, discard
/// `inner_offset` decoded bytes, then read `size` bytes: those land at
/// logical offset `offset` in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Logical offset within the file.
    pub offset: u64,
    /// Logical size of this chunk.
    pub size: u64,
    /// Absolute blob offset of the gzip member holding this chunk.
    pub compressed_offset: u64,
    /// Decoded bytes to discard before the chunk data.
    pub inner_offset: u64,
}

/// Size and chunk layout of one regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Logical file size.
    pub size: u64,
    /// Chunks sorted by (`offset`, `inner_offset`), tiling `[0, size)`.
    pub chunks: Vec<Chunk>,
}

/// Decode the gzipped tar TOC section and return the TOC.
///
/// `data` holds the blob bytes from the TOC offset to the end of the blob;
/// trailing bytes after the TOC gzip member (the footer) are ignored because
/// decoding stops at the member boundary.
pub fn parse_toc(data: &[u8]) -> Result<Toc> {
    let gz = GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries().map_err(toc_decode)? {
        let mut entry = entry.map_err(toc_decode)?;

        let matches = entry
            .path()
            .map(|p| p == Path::new(TOC_TAR_NAME))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let mut json = Vec::new();
        entry.read_to_end(&mut json).map_err(toc_decode)?;
        return serde_json::from_slice(&json).map_err(toc_decode);
    }

    Err(toc_decode(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{TOC_TAR_NAME} not found in TOC tar archive"),
    )))
}

fn toc_decode(source: impl Into<BoxedError>) -> StargzError {
    StargzError::TocDecode {
        source: source.into(),
    }
}

/// Derive the chunk plan for one file from a decoded TOC.
///
/// Collects the `reg` entry and any `chunk` continuation entries sharing the
/// exact `name`, sorts them by (`chunk_offset`, `inner_offset`), and fills in
/// inferred sizes: a zero `chunk_size` on a `reg` entry means the whole file;
/// on a `chunk` entry it extends to the next chunk's offset, falling back to
/// the end of the file, clamped at zero.
pub fn chunks_for_file(toc: &Toc, name: &str) -> Result<FileMetadata> {
    let mut found = false;
    let mut size: u64 = 0;
    let mut chunks: Vec<Chunk> = Vec::new();

    for entry in toc.entries.iter().filter(|e| e.name == name) {
        match entry.entry_type {
            TocEntryType::Reg => {
                found = true;
                size = entry.size;
                let chunk_size = if entry.chunk_size == 0 && entry.size != 0 {
                    entry.size
                } else {
                    entry.chunk_size
                };
                chunks.push(Chunk {
                    offset: entry.chunk_offset,
                    size: chunk_size,
                    compressed_offset: entry.offset,
                    inner_offset: entry.inner_offset,
                });
            }
            TocEntryType::Chunk => {
                found = true;
                let chunk_size = if entry.chunk_size == 0 && size != 0 {
                    size.saturating_sub(entry.chunk_offset)
                } else {
                    entry.chunk_size
                };
                chunks.push(Chunk {
                    offset: entry.chunk_offset,
                    size: chunk_size,
                    compressed_offset: entry.offset,
                    inner_offset: entry.inner_offset,
                });
            }
            _ => {}
        }
    }

    if !found {
        return Err(StargzError::FileNotFound {
            path: name.to_string(),
        });
    }

    chunks.sort_by_key(|c| (c.offset, c.inner_offset));

    for idx in 0..chunks.len() {
        if chunks[idx].size != 0 {
            continue;
        }
        let next_offset = if idx + 1 < chunks.len() {
            chunks[idx + 1].offset
        } else {
            size
        };
        let mut chunk_size = next_offset.saturating_sub(chunks[idx].offset);
        if chunk_size == 0 {
            chunk_size = size.saturating_sub(chunks[idx].offset);
        }
        chunks[idx].size = chunk_size;
    }

    Ok(FileMetadata { size, chunks })
}
