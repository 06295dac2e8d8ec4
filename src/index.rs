//! Image-wide file index with overlay semantics.
//!
//! An [`ImageIndex`] is built once per session by walking every layer blob in
//! manifest order and reading its TOC. Each layer contributes a raw per-layer
//! view ([`LayerInfo`]) and writes its regular files into a global map where
//! the *last* layer in manifest order wins - the same shadowing a container
//! runtime applies when it stacks layers.
//!
//! Layers whose TOC cannot be loaded (not eStargz, corrupt footer) are
//! logged and skipped; the index is still built from the remaining layers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::digest::ContentDigest;
use crate::error::{Result, StargzError};
use crate::resolver::BlobResolver;
use crate::storage::BlobStorage;
use crate::toc::TocEntryType;

/// A file in the image: where it lives and how big it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub blob_digest: ContentDigest,
    pub size: u64,
}

/// Raw per-layer view: the regular files one blob contributes.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub blob_digest: ContentDigest,
    /// Regular file paths in TOC order.
    pub file_paths: Vec<String>,
    pub file_sizes: HashMap<String, u64>,
}

/// Index of all files across all layers of one image.
#[derive(Debug, Clone, Default)]
pub struct ImageIndex {
    /// Per-layer views in manifest order.
    pub layers: Vec<LayerInfo>,
    /// Overlay view: path to owning blob and size, last layer wins.
    files: BTreeMap<String, FileInfo>,
}

impl ImageIndex {
    /// Every path in the overlay view, sorted.
    pub fn all_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Locate one file by exact path.
    ///
    /// With `blob == None` the overlay view answers; with a digest, only
    /// that layer's view is consulted. Fails with `FILE_NOT_FOUND` or, for a
    /// digest that names no layer, `BLOB_NOT_FOUND`.
    pub fn find_file(&self, path: &str, blob: Option<&ContentDigest>) -> Result<FileInfo> {
        let Some(blob) = blob else {
            return self
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| StargzError::FileNotFound {
                    path: path.to_string(),
                });
        };

        for layer in &self.layers {
            if &layer.blob_digest != blob {
                continue;
            }
            return match layer.file_sizes.get(path) {
                Some(&size) => Ok(FileInfo {
                    path: path.to_string(),
                    blob_digest: blob.clone(),
                    size,
                }),
                None => Err(StargzError::FileNotFound {
                    path: path.to_string(),
                }),
            };
        }

        Err(StargzError::BlobNotFound {
            digest: blob.to_string(),
        })
    }

    /// Files matching a path pattern.
    ///
    /// - `""`, `"."`, `"/"` match every file.
    /// - A trailing slash selects directory-prefix mode.
    /// - Otherwise the pattern matches the exact path or anything below it.
    ///
    /// With `blob == None` the overlay view is searched; with a digest only
    /// that layer's view. An unknown digest yields an empty result.
    pub fn filter_files(&self, pattern: &str, blob: Option<&ContentDigest>) -> Vec<FileInfo> {
        let matcher = PathMatcher::new(pattern);

        let Some(blob) = blob else {
            return self
                .files
                .values()
                .filter(|info| matcher.matches(&info.path))
                .cloned()
                .collect();
        };

        let mut results = Vec::new();
        for layer in &self.layers {
            if &layer.blob_digest != blob {
                continue;
            }
            for path in &layer.file_paths {
                if matcher.matches(path) {
                    results.push(FileInfo {
                        path: path.clone(),
                        blob_digest: layer.blob_digest.clone(),
                        size: layer.file_sizes.get(path).copied().unwrap_or(0),
                    });
                }
            }
            break;
        }
        results
    }
}

/// Path pattern matching for [`ImageIndex::filter_files`].
struct PathMatcher {
    match_all: bool,
    pattern: String,
    dir_prefix: bool,
}

impl PathMatcher {
    fn new(pattern: &str) -> Self {
        if pattern.is_empty() || pattern == "." || pattern == "/" {
            return PathMatcher {
                match_all: true,
                pattern: String::new(),
                dir_prefix: false,
            };
        }

        let dir_prefix = pattern.ends_with('/');
        let pattern = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        };

        PathMatcher {
            match_all: false,
            pattern,
            dir_prefix,
        }
    }

    fn matches(&self, path: &str) -> bool {
        if self.match_all {
            return true;
        }

        let rooted;
        let path = if path.starts_with('/') {
            path
        } else {
            rooted = format!("/{path}");
            &rooted
        };

        if self.dir_prefix {
            return path.starts_with(&self.pattern);
        }

        path == self.pattern || path.starts_with(&format!("{}/", self.pattern))
    }
}

/// Builds an [`ImageIndex`] from every blob enumerated by storage.
pub struct IndexLoader {
    storage: Arc<dyn BlobStorage>,
    resolver: Arc<dyn BlobResolver>,
}

impl IndexLoader {
    pub fn new(storage: Arc<dyn BlobStorage>, resolver: Arc<dyn BlobResolver>) -> Self {
        IndexLoader { storage, resolver }
    }

    /// Walk all blobs in manifest order and build the index.
    pub fn load(&self) -> Result<ImageIndex> {
        let blobs = self.storage.list_blobs()?;
        if blobs.is_empty() {
            return Err(StargzError::EmptyImage);
        }

        let mut index = ImageIndex::default();

        for blob in blobs {
            let toc = match self.resolver.toc(&blob.digest) {
                Ok(toc) => toc,
                Err(e) => {
                    tracing::warn!(blob = %blob.digest, error = %e, "skipping layer: TOC load failed");
                    continue;
                }
            };

            let mut layer = LayerInfo {
                blob_digest: blob.digest.clone(),
                file_paths: Vec::new(),
                file_sizes: HashMap::new(),
            };

            for entry in &toc.entries {
                if entry.entry_type != TocEntryType::Reg {
                    continue;
                }
                layer.file_paths.push(entry.name.clone());
                layer.file_sizes.insert(entry.name.clone(), entry.size);
                index.files.insert(
                    entry.name.clone(),
                    FileInfo {
                        path: entry.name.clone(),
                        blob_digest: blob.digest.clone(),
                        size: entry.size,
                    },
                );
            }

            index.layers.push(layer);
        }

        Ok(index)
    }
}
