//! Blob storage abstraction.
//!
//! The only primitive the rest of the library needs for bytes is a ranged
//! reader over a blob identified by its digest. [`BlobStorage`] captures
//! that contract; [`crate::registry::RegistryStorage`] implements it against
//! a remote OCI registry and [`MemoryStorage`] against an in-memory blob
//! table for tests.

use std::io::{Cursor, Read};
use std::sync::Mutex;

use crate::digest::ContentDigest;
use crate::error::{Result, StargzError};

/// Describes a blob available from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// Content digest identifying the blob.
    pub digest: ContentDigest,
    /// Size of the blob in bytes.
    pub size: u64,
    /// Media type from the manifest descriptor.
    pub media_type: String,
}

/// Abstracts blob enumeration and ranged reads.
pub trait BlobStorage: Send + Sync {
    /// Blobs of the image, in manifest layer order.
    fn list_blobs(&self) -> Result<Vec<BlobDescriptor>>;

    /// A reader positioned at `offset` within the blob.
    ///
    /// `length == 0` means "to the end of the blob"; a non-zero `length`
    /// yields exactly that many bytes.
    fn read_blob(
        &self,
        digest: &ContentDigest,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>>;
}

/// In-memory [`BlobStorage`] for tests.
///
/// Preserves insertion order in [`list_blobs`](BlobStorage::list_blobs) so
/// layer-order semantics can be exercised without a registry.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<Vec<MemoryBlob>>,
}

#[derive(Debug)]
struct MemoryBlob {
    digest: ContentDigest,
    media_type: String,
    data: Vec<u8>,
}

impl MemoryStorage {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add blob content, returning its computed digest.
    ///
    /// Adding identical content twice replaces the earlier copy (the digest
    /// is the identity).
    pub fn add_blob(&self, media_type: &str, data: &[u8]) -> ContentDigest {
        let digest = ContentDigest::from_bytes(data);
        let mut blobs = self.blobs.lock().unwrap();
        blobs.retain(|b| b.digest != digest);
        blobs.push(MemoryBlob {
            digest: digest.clone(),
            media_type: media_type.to_string(),
            data: data.to_vec(),
        });
        digest
    }
}

impl BlobStorage for MemoryStorage {
    fn list_blobs(&self) -> Result<Vec<BlobDescriptor>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .iter()
            .map(|b| BlobDescriptor {
                digest: b.digest.clone(),
                size: b.data.len() as u64,
                media_type: b.media_type.clone(),
            })
            .collect())
    }

    fn read_blob(
        &self,
        digest: &ContentDigest,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .iter()
            .find(|b| &b.digest == digest)
            .ok_or_else(|| StargzError::BlobNotFound {
                digest: digest.to_string(),
            })?;

        let len = blob.data.len() as u64;
        if offset > len {
            return Err(StargzError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid offset {offset} for blob of {len} bytes"),
            )));
        }

        let end = if length > 0 { len.min(offset + length) } else { len };
        let slice = blob.data[offset as usize..end as usize].to_vec();
        Ok(Box::new(Cursor::new(slice)))
    }
}
