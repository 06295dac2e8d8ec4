//! Lazy file extraction from eStargz container images.
//!
//! This library pulls individual files or directory subtrees out of OCI
//! images whose layers use the eStargz (seekable tar+gzip) format - without
//! ever materializing a full layer blob. It fetches only what a request
//! needs: the registry manifest, the small Table of Contents (TOC) at the
//! tail of each layer, and the compressed gzip members covering the
//! requested files.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   manifest    ┌──────────────────┐
//! │ Registry-  │──────────────▶│  RegistryStorage │  ranged GETs
//! │ Client     │               │  (BlobStorage)   │◀────────────┐
//! └────────────┘               └──────────────────┘             │
//!                                      │ footer + TOC           │
//!                                      ▼                        │
//!                              ┌──────────────┐   chunk plans   │
//!                              │  TocResolver │────────────────▶│
//!                              └──────────────┘                 │
//!                                      │                        │
//!                 per-layer TOCs       ▼                        │
//!                              ┌──────────────┐  jobs   ┌───────┴────┐
//!                              │  IndexLoader │────────▶│ Downloader │
//!                              └──────────────┘         └────────────┘
//! ```
//!
//! [`RegistryClient`] fetches the manifest and hands out a
//! [`RegistryStorage`] serving ranged blob reads with shared authentication.
//! [`TocResolver`] caches per-blob TOCs and derives per-file chunk plans.
//! [`IndexLoader`] builds the overlay file index across layers, and
//! [`Downloader`] executes download jobs with worker threads, retries, and
//! progress reporting. Both seams ([`BlobStorage`], [`BlobResolver`]) are
//! traits, so tests run against in-memory doubles ([`MemoryStorage`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stargz_fetch::{
//!     DownloadJob, DownloadOptions, Downloader, ImageReference, IndexLoader,
//!     RegistryClient, TocResolver,
//! };
//!
//! let reference = ImageReference::parse("ghcr.io/stargz-containers/node:13.13.0-esgz")?;
//! let client = RegistryClient::new();
//! let manifest = client.fetch_manifest(&reference)?;
//!
//! let storage = Arc::new(client.storage(&reference, &manifest));
//! let resolver = Arc::new(TocResolver::new(storage.clone()));
//! let index = IndexLoader::new(storage.clone(), resolver.clone()).load()?;
//!
//! let jobs: Vec<DownloadJob> = index
//!     .filter_files("usr/bin/", None)
//!     .into_iter()
//!     .map(|file| DownloadJob {
//!         output_path: std::path::Path::new("out").join(&file.path),
//!         path: file.path,
//!         blob_digest: file.blob_digest,
//!         size: file.size,
//!     })
//!     .collect();
//!
//! let downloader = Downloader::new(resolver, storage);
//! let stats = downloader.start_download(&jobs, None, &DownloadOptions::default())?;
//! println!("downloaded {} files", stats.downloaded_files);
//! # Ok::<(), stargz_fetch::StargzError>(())
//! ```

pub mod cancel;
pub mod digest;
pub mod download;
pub mod error;
pub mod footer;
pub mod index;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod storage;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod toc;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use digest::ContentDigest;
pub use download::{
    DownloadJob, DownloadOptions, DownloadStats, Downloader, ProgressFn, StatusFn,
};
pub use error::{Result, StargzError};
pub use index::{FileInfo, ImageIndex, IndexLoader, LayerInfo};
pub use reference::ImageReference;
pub use registry::{Credential, Descriptor, Manifest, RegistryClient, RegistryStorage};
pub use resolver::{BlobResolver, TocResolver};
pub use storage::{BlobDescriptor, BlobStorage, MemoryStorage};
pub use toc::{Chunk, FileMetadata, Toc, TocEntry, TocEntryType};
