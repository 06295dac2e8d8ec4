//! Builders for synthetic eStargz blobs.
//!
//! Test suites need well-formed blobs - per-chunk gzip members, a gzipped
//! tar TOC section, and a footer - without talking to a registry. The
//! [`BlobBuilder`] here produces exactly that layout.
//!
//! Compiled only for this crate's own tests and behind the `test-util`
//! feature; release builds carry none of it.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::footer::{footer_bytes, legacy_footer_bytes};
use crate::toc::{Toc, TocEntry, TocEntryType, TOC_TAR_NAME};

/// Builds an in-memory eStargz blob from file specs.
#[derive(Debug, Default)]
pub struct BlobBuilder {
    files: Vec<FileSpec>,
    legacy_footer: bool,
}

#[derive(Debug)]
struct FileSpec {
    name: String,
    content: Vec<u8>,
    chunk_size: usize,
}

impl BlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file stored as a single gzip member.
    pub fn file(self, name: &str, content: &[u8]) -> Self {
        self.chunked_file(name, content, 0)
    }

    /// Add a file split into gzip members of `chunk_size` decoded bytes
    /// each (0 means a single member).
    pub fn chunked_file(mut self, name: &str, content: &[u8], chunk_size: usize) -> Self {
        self.files.push(FileSpec {
            name: name.to_string(),
            content: content.to_vec(),
            chunk_size,
        });
        self
    }

    /// Emit the legacy 47-byte footer instead of the modern one.
    pub fn legacy_footer(mut self) -> Self {
        self.legacy_footer = true;
        self
    }

    /// Assemble the blob: content members, TOC section, footer.
    pub fn build(self) -> Vec<u8> {
        let mut blob = Vec::new();
        let mut entries = Vec::new();

        for spec in &self.files {
            let size = spec.content.len();
            if size == 0 {
                let mut entry = TocEntry::new(&spec.name, TocEntryType::Reg);
                entry.offset = blob.len() as u64;
                entries.push(entry);
                continue;
            }

            let chunk_size = if spec.chunk_size == 0 || spec.chunk_size > size {
                size
            } else {
                spec.chunk_size
            };

            let mut logical_offset = 0usize;
            while logical_offset < size {
                let end = (logical_offset + chunk_size).min(size);
                let compressed_offset = blob.len() as u64;
                blob.extend_from_slice(&gzip_member(&spec.content[logical_offset..end]));

                let mut entry = if logical_offset == 0 {
                    let mut e = TocEntry::new(&spec.name, TocEntryType::Reg);
                    e.size = size as u64;
                    e
                } else {
                    TocEntry::new(&spec.name, TocEntryType::Chunk)
                };
                entry.offset = compressed_offset;
                entry.chunk_offset = logical_offset as u64;
                if end - logical_offset < size {
                    entry.chunk_size = (end - logical_offset) as u64;
                }
                entries.push(entry);

                logical_offset = end;
            }
        }

        let toc_offset = blob.len() as u64;
        blob.extend_from_slice(&toc_section(&Toc {
            version: 1,
            entries,
        }));

        if self.legacy_footer {
            blob.extend_from_slice(&legacy_footer_bytes(toc_offset));
        } else {
            blob.extend_from_slice(&footer_bytes(toc_offset));
        }

        blob
    }
}

fn gzip_member(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("write to in-memory gzip");
    encoder.finish().expect("finish in-memory gzip")
}

fn toc_section(toc: &Toc) -> Vec<u8> {
    let json = serde_json::to_vec(toc).expect("serialize TOC");

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, TOC_TAR_NAME, json.as_slice())
        .expect("append TOC entry");
    let tar_bytes = builder.into_inner().expect("finish TOC tar");

    gzip_member(&tar_bytes)
}
