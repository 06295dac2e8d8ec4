//! Concurrent download orchestration.
//!
//! A [`Downloader`] executes a batch of [`DownloadJob`]s: for each file it
//! resolves the chunk plan, issues ranged reads for the covering gzip
//! members, decodes them, and assembles the file with positional writes.
//! Jobs are distributed to a pool of worker threads; large multi-chunk files
//! additionally fan their chunks out to inner workers.
//!
//! Every job gets a stable `base_offset` (the prefix sum of job sizes in
//! input order), so aggregate progress is deterministic regardless of
//! completion order. Per-file failures are retried up to `max_retries`
//! times and then counted - they never abort the batch.

use std::fs::{DirBuilder, File};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, FileExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use flate2::read::GzDecoder;

use crate::cancel::CancelToken;
use crate::digest::ContentDigest;
use crate::error::{BoxedError, Result, StargzError};
use crate::resolver::BlobResolver;
use crate::storage::BlobStorage;
use crate::toc::{Chunk, FileMetadata};

/// Called with `(current, total)` aggregate byte progress.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Called with `(active_files, completed_files, total_files)` when a job
/// starts or finishes.
pub type StatusFn = dyn Fn(&[String], usize, usize) + Send + Sync;

/// Default number of retries per file.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default number of concurrent worker threads.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default minimum file size for chunked single-file downloads (10 MiB).
pub const DEFAULT_SINGLE_FILE_CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

/// A single file to download.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// File path in the image.
    pub path: String,
    /// Blob containing this file.
    pub blob_digest: ContentDigest,
    /// Logical file size.
    pub size: u64,
    /// Where to write the file locally.
    pub output_path: PathBuf,
}

/// Cumulative counters for one [`Downloader::start_download`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub downloaded_files: usize,
    pub downloaded_bytes: u64,
    /// Files that failed after all retries.
    pub failed_files: usize,
    /// Total retries performed across all files.
    pub retries: usize,
}

/// Download behavior knobs. Zero values revert to the defaults.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Retries per file (default 3).
    pub max_retries: usize,
    /// Worker threads (default 4; 1 means sequential).
    pub concurrency: usize,
    /// Status callback for file start/finish events.
    pub on_status: Option<Arc<StatusFn>>,
    /// Files at least this large may use chunked download (default 10 MiB).
    pub single_file_chunk_threshold: u64,
    /// Cancellation signal observed between chunks and before ranged reads.
    pub cancel: CancelToken,
}

/// Options with defaults applied.
struct Effective {
    max_retries: usize,
    concurrency: usize,
    on_status: Option<Arc<StatusFn>>,
    threshold: u64,
    cancel: CancelToken,
}

impl DownloadOptions {
    fn effective(&self) -> Effective {
        Effective {
            max_retries: if self.max_retries == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                self.max_retries
            },
            concurrency: if self.concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                self.concurrency
            },
            on_status: self.on_status.clone(),
            threshold: if self.single_file_chunk_threshold == 0 {
                DEFAULT_SINGLE_FILE_CHUNK_THRESHOLD
            } else {
                self.single_file_chunk_threshold
            },
            cancel: self.cancel.clone(),
        }
    }
}

/// Shared per-batch state; one mutex covers stats, the active-file set, and
/// progress emission, mirroring the single critical section the accounting
/// invariants assume.
struct Shared {
    inner: Mutex<SharedInner>,
}

struct SharedInner {
    stats: DownloadStats,
    active: Vec<String>,
}

/// Downloads batches of files via a [`BlobResolver`] and [`BlobStorage`].
pub struct Downloader {
    resolver: Arc<dyn BlobResolver>,
    storage: Arc<dyn BlobStorage>,
}

impl Downloader {
    pub fn new(resolver: Arc<dyn BlobResolver>, storage: Arc<dyn BlobStorage>) -> Self {
        Downloader { resolver, storage }
    }

    /// Execute a batch of jobs with retries, concurrency, and progress.
    ///
    /// Returns the final stats; per-file failures are counted there and do
    /// not surface as an `Err`.
    pub fn start_download(
        &self,
        jobs: &[DownloadJob],
        progress: Option<&ProgressFn>,
        opts: &DownloadOptions,
    ) -> Result<DownloadStats> {
        if jobs.is_empty() {
            return Ok(DownloadStats::default());
        }

        let opts = opts.effective();
        let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();

        let shared = Shared {
            inner: Mutex::new(SharedInner {
                stats: DownloadStats {
                    total_files: jobs.len(),
                    total_bytes,
                    ..DownloadStats::default()
                },
                active: Vec::with_capacity(opts.concurrency),
            }),
        };

        if let Some(progress) = progress {
            progress(0, total_bytes);
        }

        // FIFO job feed: indexes plus pre-computed base offsets.
        let (tx, rx) = mpsc::channel::<(usize, u64)>();
        let mut base_offset = 0u64;
        for (idx, job) in jobs.iter().enumerate() {
            let _ = tx.send((idx, base_offset));
            base_offset += job.size;
        }
        drop(tx);
        let rx = Mutex::new(rx);

        thread::scope(|scope| {
            for _ in 0..opts.concurrency {
                scope.spawn(|| loop {
                    let next = rx.lock().unwrap().recv();
                    let Ok((idx, base_offset)) = next else {
                        break;
                    };
                    self.process_job(
                        &jobs[idx],
                        base_offset,
                        total_bytes,
                        progress,
                        &opts,
                        &shared,
                    );
                });
            }
        });

        Ok(shared.inner.into_inner().unwrap().stats)
    }

    /// Run one job to completion: retry loop, stats, status notifications.
    fn process_job(
        &self,
        job: &DownloadJob,
        base_offset: u64,
        total_bytes: u64,
        progress: Option<&ProgressFn>,
        opts: &Effective,
        shared: &Shared,
    ) {
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.active.push(job.path.clone());
            if let Some(on_status) = &opts.on_status {
                on_status(
                    &inner.active,
                    inner.stats.downloaded_files,
                    inner.stats.total_files,
                );
            }
        }

        tracing::debug!(path = %job.path, size = job.size, "starting download");

        let mut downloaded = false;
        let mut last_err: Option<StargzError> = None;

        for attempt in 0..=opts.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    path = %job.path,
                    attempt,
                    max_retries = opts.max_retries,
                    error = %last_err.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "retrying download"
                );
                shared.inner.lock().unwrap().stats.retries += 1;
            }

            if opts.cancel.is_cancelled() {
                break;
            }

            match self.download_single_file(job, base_offset, total_bytes, progress, opts, shared)
            {
                Ok(()) => {
                    downloaded = true;
                    let mut inner = shared.inner.lock().unwrap();
                    inner.stats.downloaded_files += 1;
                    inner.stats.downloaded_bytes += job.size;
                    drop(inner);
                    tracing::info!(path = %job.path, bytes = job.size, "downloaded");
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        {
            let mut inner = shared.inner.lock().unwrap();
            if let Some(pos) = inner.active.iter().position(|p| p == &job.path) {
                inner.active.remove(pos);
            }
            if let Some(on_status) = &opts.on_status {
                on_status(
                    &inner.active,
                    inner.stats.downloaded_files,
                    inner.stats.total_files,
                );
            }
        }

        if !downloaded {
            shared.inner.lock().unwrap().stats.failed_files += 1;
            tracing::error!(
                path = %job.path,
                attempts = opts.max_retries + 1,
                error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
                "download failed"
            );
        }
    }

    /// One download attempt for one file, starting from a truncated output.
    fn download_single_file(
        &self,
        job: &DownloadJob,
        base_offset: u64,
        total_bytes: u64,
        progress: Option<&ProgressFn>,
        opts: &Effective,
        shared: &Shared,
    ) -> Result<()> {
        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .map_err(|e| download_failed(&job.path, e))?;
        }

        let out = File::create(&job.output_path).map_err(|e| download_failed(&job.path, e))?;

        let metadata = self
            .resolver
            .file_metadata(&job.blob_digest, &job.path)
            .map_err(|e| download_failed(&job.path, e))?;

        if metadata.chunks.iter().all(|c| c.size == 0) {
            out.set_len(metadata.size)
                .map_err(|e| download_failed(&job.path, e))?;
            if job.size == 0 {
                if let Some(progress) = progress {
                    let _guard = shared.inner.lock().unwrap();
                    progress(base_offset, total_bytes);
                }
            }
            return Ok(());
        }

        let chunked = metadata.chunks.len() > 1
            && metadata.size >= opts.threshold
            && job.size >= opts.threshold;
        let workers = if chunked {
            opts.concurrency.min(metadata.chunks.len()).max(1)
        } else {
            1
        };

        self.download_file_chunks(
            job,
            &metadata,
            &out,
            base_offset,
            total_bytes,
            progress,
            opts,
            shared,
            workers,
        )?;

        out.set_len(metadata.size)
            .map_err(|e| download_failed(&job.path, e))?;
        Ok(())
    }

    /// Fetch, decode, and write every chunk of one file.
    ///
    /// With `workers > 1` chunks are distributed to inner threads; the first
    /// error cancels peers through a local token and is surfaced.
    #[allow(clippy::too_many_arguments)]
    fn download_file_chunks(
        &self,
        job: &DownloadJob,
        metadata: &FileMetadata,
        out: &File,
        base_offset: u64,
        total_bytes: u64,
        progress: Option<&ProgressFn>,
        opts: &Effective,
        shared: &Shared,
        workers: usize,
    ) -> Result<()> {
        let completed = AtomicU64::new(0);

        let emit_progress = |decoded: u64| {
            if let Some(progress) = progress {
                let current = completed.fetch_add(decoded, Ordering::SeqCst) + decoded;
                let _guard = shared.inner.lock().unwrap();
                progress(base_offset + current, total_bytes);
            }
        };

        if workers <= 1 {
            for chunk in &metadata.chunks {
                if chunk.size == 0 {
                    continue;
                }
                if opts.cancel.is_cancelled() {
                    return Err(cancelled(&job.path));
                }
                let data = self.read_chunk(job, chunk, &opts.cancel)?;
                out.write_all_at(&data, chunk.offset)
                    .map_err(|e| download_failed(&job.path, e))?;
                emit_progress(data.len() as u64);
            }
            return Ok(());
        }

        let failure: Mutex<Option<StargzError>> = Mutex::new(None);
        let local_cancel = CancelToken::new();

        let record_failure = |err: StargzError| {
            let mut slot = failure.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
            local_cancel.cancel();
        };

        let (tx, rx) = mpsc::channel::<Chunk>();
        let rx = Mutex::new(rx);

        thread::scope(|scope| {
            let local_cancel = &local_cancel;
            let record_failure = &record_failure;

            for _ in 0..workers {
                let rx = &rx;
                scope.spawn(move || loop {
                    let next = rx.lock().unwrap().recv();
                    let Ok(chunk) = next else { break };

                    if local_cancel.is_cancelled() {
                        return;
                    }
                    if opts.cancel.is_cancelled() {
                        record_failure(cancelled(&job.path));
                        return;
                    }

                    let data = match self.read_chunk(job, &chunk, &opts.cancel) {
                        Ok(data) => data,
                        Err(e) => {
                            record_failure(e);
                            return;
                        }
                    };

                    if let Err(e) = out.write_all_at(&data, chunk.offset) {
                        record_failure(download_failed(&job.path, e));
                        return;
                    }

                    emit_progress(data.len() as u64);
                });
            }

            for chunk in &metadata.chunks {
                if chunk.size == 0 {
                    continue;
                }
                if local_cancel.is_cancelled() || opts.cancel.is_cancelled() {
                    break;
                }
                if tx.send(*chunk).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(err) = failure.into_inner().unwrap() {
            return Err(err);
        }
        if opts.cancel.is_cancelled() {
            return Err(cancelled(&job.path));
        }
        Ok(())
    }

    /// Fetch one chunk: ranged read from its gzip member, fresh decoder,
    /// discard `inner_offset` decoded bytes, read exactly `size` bytes.
    fn read_chunk(&self, job: &DownloadJob, chunk: &Chunk, cancel: &CancelToken) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(cancelled(&job.path));
        }

        let reader = self
            .storage
            .read_blob(&job.blob_digest, chunk.compressed_offset, 0)
            .map_err(|e| download_failed(&job.path, e))?;

        let mut gz = GzDecoder::new(reader);

        if chunk.inner_offset > 0 {
            let skipped = io::copy(&mut (&mut gz).take(chunk.inner_offset), &mut io::sink())
                .map_err(|e| download_failed(&job.path, e))?;
            if skipped != chunk.inner_offset {
                return Err(download_failed(
                    &job.path,
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                ));
            }
        }

        let mut buf = vec![0u8; chunk.size as usize];
        gz.read_exact(&mut buf)
            .map_err(|e| download_failed(&job.path, e))?;
        Ok(buf)
    }
}

fn download_failed(path: &str, source: impl Into<BoxedError>) -> StargzError {
    StargzError::DownloadFailed {
        path: path.to_string(),
        source: source.into(),
    }
}

fn cancelled(path: &str) -> StargzError {
    download_failed(path, io::Error::new(io::ErrorKind::Interrupted, "cancelled"))
}
