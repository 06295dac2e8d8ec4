//! TOC resolution and caching.
//!
//! A [`TocResolver`] answers "what is the chunk plan for file P in blob B?"
//! on top of any [`BlobStorage`]. TOCs are fetched on first demand - footer
//! tail read, footer parse, TOC section read, decode - and cached for the
//! lifetime of the resolver. Blob digests are content-addressed, so cached
//! TOCs never need invalidation.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use crate::digest::ContentDigest;
use crate::error::{BoxedError, Result, StargzError};
use crate::footer::{parse_footer, FOOTER_SIZE};
use crate::storage::BlobStorage;
use crate::toc::{chunks_for_file, parse_toc, FileMetadata, Toc};

/// Resolves file metadata and TOCs for blobs.
pub trait BlobResolver: Send + Sync {
    /// Size and chunk plan for one file in one blob.
    fn file_metadata(&self, blob: &ContentDigest, path: &str) -> Result<FileMetadata>;

    /// The decoded TOC of a blob, shared by reference count.
    fn toc(&self, blob: &ContentDigest) -> Result<Arc<Toc>>;
}

/// Caching [`BlobResolver`] over a [`BlobStorage`].
pub struct TocResolver {
    storage: Arc<dyn BlobStorage>,
    state: Mutex<ResolverState>,
}

#[derive(Default)]
struct ResolverState {
    /// Blob sizes from `list_blobs`, populated on first use.
    blob_sizes: Option<HashMap<ContentDigest, u64>>,
    tocs: HashMap<ContentDigest, Arc<Toc>>,
}

impl TocResolver {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        TocResolver {
            storage,
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Blob size from the cached snapshot, listing blobs on first call.
    fn blob_size(&self, blob: &ContentDigest) -> Result<u64> {
        {
            let state = self.state.lock().unwrap();
            if let Some(sizes) = &state.blob_sizes {
                return sizes.get(blob).copied().ok_or_else(|| unknown(blob));
            }
        }

        let blobs = self.storage.list_blobs()?;
        let mut state = self.state.lock().unwrap();
        let sizes = state.blob_sizes.get_or_insert_with(|| {
            blobs.iter().map(|b| (b.digest.clone(), b.size)).collect()
        });
        sizes.get(blob).copied().ok_or_else(|| unknown(blob))
    }

    fn load_toc(&self, blob: &ContentDigest) -> Result<Arc<Toc>> {
        if let Some(toc) = self.state.lock().unwrap().tocs.get(blob) {
            tracing::debug!(blob = blob.short(), "TOC cache hit");
            return Ok(Arc::clone(toc));
        }

        let size = self.blob_size(blob)?;
        tracing::info!(blob = blob.short(), size, "downloading TOC");

        let tail_len = FOOTER_SIZE.min(size);
        let tail = self
            .read_range(blob, size - tail_len, tail_len)
            .map_err(|e| toc_download(blob, e))?;

        let (toc_offset, _footer_size) =
            parse_footer(&tail).map_err(|e| toc_download(blob, e))?;
        if toc_offset >= size {
            return Err(toc_download(
                blob,
                StargzError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("TOC offset {toc_offset} beyond blob size {size}"),
                )),
            ));
        }
        tracing::debug!(blob = blob.short(), toc_offset, "parsed footer");

        let section = self
            .read_range(blob, toc_offset, size - toc_offset)
            .map_err(|e| toc_download(blob, e))?;
        let toc = Arc::new(parse_toc(&section).map_err(|e| toc_download(blob, e))?);

        // Concurrent loaders may race here; the blob is content-addressed,
        // so last-writer-wins is harmless.
        self.state
            .lock()
            .unwrap()
            .tocs
            .insert(blob.clone(), Arc::clone(&toc));

        Ok(toc)
    }

    fn read_range(&self, blob: &ContentDigest, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut reader = self.storage.read_blob(blob, offset, length)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl BlobResolver for TocResolver {
    fn file_metadata(&self, blob: &ContentDigest, path: &str) -> Result<FileMetadata> {
        let toc = self.load_toc(blob)?;
        chunks_for_file(&toc, path)
    }

    fn toc(&self, blob: &ContentDigest) -> Result<Arc<Toc>> {
        self.load_toc(blob)
    }
}

fn unknown(blob: &ContentDigest) -> StargzError {
    StargzError::UnknownBlob {
        digest: blob.to_string(),
    }
}

fn toc_download(blob: &ContentDigest, source: impl Into<BoxedError>) -> StargzError {
    StargzError::TocDownload {
        digest: blob.to_string(),
        source: source.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobDescriptor, MemoryStorage};
    use crate::testutil::BlobBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Storage wrapper counting `read_blob` calls.
    struct CountingStorage {
        inner: MemoryStorage,
        reads: AtomicUsize,
    }

    impl BlobStorage for CountingStorage {
        fn list_blobs(&self) -> Result<Vec<BlobDescriptor>> {
            self.inner.list_blobs()
        }

        fn read_blob(
            &self,
            digest: &ContentDigest,
            offset: u64,
            length: u64,
        ) -> Result<Box<dyn Read + Send>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_blob(digest, offset, length)
        }
    }

    #[test]
    fn test_file_metadata_from_synthetic_blob() {
        let blob = BlobBuilder::new()
            .file("bin/echo", b"echo content")
            .build();
        let storage = MemoryStorage::new();
        let digest = storage.add_blob("application/test", &blob);

        let resolver = TocResolver::new(Arc::new(storage));
        let metadata = resolver.file_metadata(&digest, "bin/echo").unwrap();
        assert_eq!(metadata.size, 12);
        assert_eq!(metadata.chunks.len(), 1);

        let err = resolver.file_metadata(&digest, "bin/cat").unwrap_err();
        assert_eq!(err.code(), "FILE_NOT_FOUND");
    }

    #[test]
    fn test_toc_is_cached_per_blob() {
        let blob = BlobBuilder::new().file("a", b"data").build();
        let inner = MemoryStorage::new();
        let digest = inner.add_blob("application/test", &blob);
        let storage = Arc::new(CountingStorage {
            inner,
            reads: AtomicUsize::new(0),
        });

        let resolver = TocResolver::new(storage.clone());
        resolver.toc(&digest).unwrap();
        let reads_after_first = storage.reads.load(Ordering::SeqCst);
        assert!(reads_after_first >= 2, "footer + TOC section reads");

        resolver.toc(&digest).unwrap();
        resolver.file_metadata(&digest, "a").unwrap();
        assert_eq!(
            storage.reads.load(Ordering::SeqCst),
            reads_after_first,
            "cached TOC must not re-read the blob"
        );
    }

    #[test]
    fn test_unknown_blob_digest() {
        let storage = MemoryStorage::new();
        storage.add_blob("application/test", b"whatever");

        let resolver = TocResolver::new(Arc::new(storage));
        let missing = ContentDigest::from_bytes(b"missing");
        let err = resolver.toc(&missing).unwrap_err();
        assert_eq!(err.code(), "BLOB_NOT_FOUND");
        assert!(matches!(err, StargzError::UnknownBlob { .. }));
    }

    #[test]
    fn test_non_estargz_blob_is_rejected() {
        let storage = MemoryStorage::new();
        // Plain bytes, no seekable footer.
        let digest = storage.add_blob("application/test", &[0u8; 256]);

        let resolver = TocResolver::new(Arc::new(storage));
        let err = resolver.toc(&digest).unwrap_err();
        assert_eq!(err.code(), "TOC_DOWNLOAD_FAILED");
    }

    #[test]
    fn test_blob_smaller_than_footer_is_rejected() {
        let storage = MemoryStorage::new();
        let digest = storage.add_blob("application/test", b"tiny");

        let resolver = TocResolver::new(Arc::new(storage));
        assert!(resolver.toc(&digest).is_err());
    }
}
