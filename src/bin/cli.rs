//! stargz-fetch: fetch files from eStargz container images.
//!
//! Three subcommands over the library:
//!
//! - `info <IMAGE_REF>` - list the layers of an image in manifest order.
//! - `ls <IMAGE_REF> [BLOB]` - list files (overlay view, or one layer).
//! - `get <IMAGE_REF> [BLOB] <PATH> [OUTPUT_DIR]` - download matching
//!   files, fetching only the byte ranges that cover them.
//!
//! The process exits non-zero on any error, on any per-file download
//! failure, and when a pattern matches nothing.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use stargz_fetch::{
    ContentDigest, DownloadJob, DownloadOptions, Downloader, ImageReference, IndexLoader,
    RegistryClient, StargzError, TocResolver,
};

#[derive(Parser)]
#[command(name = "stargz-fetch")]
#[command(about = "Fetch files from eStargz container images without pulling whole layers", long_about = None)]
struct Cli {
    /// Registry credential in the form USER:PASSWORD
    #[arg(long, global = true)]
    credential: Option<String>,

    /// Enable verbose logging (INFO level)
    #[arg(long, global = true)]
    verbose: bool,

    /// Enable debug logging (DEBUG level)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all layers of an image
    Info {
        /// Image reference: HOST[:PORT]/REPO[:TAG]
        image: String,
    },

    /// List files in an image (or in a single layer)
    Ls {
        /// Image reference: HOST[:PORT]/REPO[:TAG]
        image: String,

        /// Layer blob digest (sha256:…); omit for the overlay view
        blob: Option<String>,
    },

    /// Download files matching a path pattern
    ///
    /// Positional arguments after the image reference are
    /// `[BLOB] PATH [OUTPUT_DIR]`; a blob digest is recognized by its
    /// `sha` prefix. PATH may be a file, a directory (trailing slash or
    /// not), or `.` / `/` for everything.
    Get {
        /// Image reference: HOST[:PORT]/REPO[:TAG]
        image: String,

        /// [BLOB] PATH [OUTPUT_DIR]
        #[arg(num_args = 1..=3, required = true)]
        args: Vec<String>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Number of concurrent workers (1 for sequential)
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::ERROR
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let client = build_client(cli.credential.as_deref())?;

    match cli.command {
        Commands::Info { image } => run_info(&client, &image),
        Commands::Ls { image, blob } => run_ls(&client, &image, blob.as_deref()),
        Commands::Get {
            image,
            args,
            no_progress,
            concurrency,
        } => run_get(&client, &image, &args, no_progress, concurrency),
    }
}

fn build_client(credential: Option<&str>) -> Result<RegistryClient> {
    let client = RegistryClient::new();
    match credential {
        Some(credential) => {
            let (username, password) = credential
                .split_once(':')
                .context("invalid credential format, expected USER:PASSWORD")?;
            Ok(client.with_credential(username, password))
        }
        None => Ok(client),
    }
}

/// Wrap a library error with its machine code for the terminal.
fn coded(err: StargzError) -> anyhow::Error {
    let code = err.code();
    anyhow!("[{code}] {:#}", anyhow::Error::new(err))
}

fn run_info(client: &RegistryClient, image: &str) -> Result<()> {
    let reference = ImageReference::parse(image).map_err(coded)?;
    let manifest = client.fetch_manifest(&reference).map_err(coded)?;

    println!("Layers for {reference}:");
    for (i, layer) in manifest.layers.iter().enumerate() {
        println!(
            "{}: {} (size: {} bytes, type: {})",
            i, layer.digest, layer.size, layer.media_type
        );
    }

    Ok(())
}

fn run_ls(client: &RegistryClient, image: &str, blob: Option<&str>) -> Result<()> {
    let reference = ImageReference::parse(image).map_err(coded)?;
    let manifest = client.fetch_manifest(&reference).map_err(coded)?;

    let storage = Arc::new(client.storage(&reference, &manifest));
    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage, resolver).load().map_err(coded)?;

    match blob {
        Some(blob) => {
            let digest = ContentDigest::parse(blob).map_err(coded)?;
            let layer = index
                .layers
                .iter()
                .find(|l| l.blob_digest == digest)
                .with_context(|| format!("blob not found: {digest}"))?;

            println!("Files in blob {digest}:");
            for path in &layer.file_paths {
                println!("{path}");
            }
        }
        None => {
            println!("All files in {reference}:");
            for path in index.all_files() {
                println!("{path}");
            }
        }
    }

    Ok(())
}

fn run_get(
    client: &RegistryClient,
    image: &str,
    args: &[String],
    no_progress: bool,
    concurrency: usize,
) -> Result<()> {
    // [BLOB] PATH [OUTPUT_DIR]: a digest is recognized by its sha prefix.
    let has_blob = args.len() >= 2 && args[0].starts_with("sha");
    let (blob, pattern, output_dir) = if has_blob {
        (
            Some(args[0].as_str()),
            args[1].as_str(),
            args.get(2).map(String::as_str).unwrap_or("."),
        )
    } else {
        (
            None,
            args[0].as_str(),
            args.get(1).map(String::as_str).unwrap_or("."),
        )
    };

    let pattern = if pattern == "*" { "." } else { pattern };

    let reference = ImageReference::parse(image).map_err(coded)?;
    let manifest = client.fetch_manifest(&reference).map_err(coded)?;

    let storage = Arc::new(client.storage(&reference, &manifest));
    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .map_err(coded)?;

    let digest = blob
        .map(ContentDigest::parse)
        .transpose()
        .map_err(coded)?;

    let matched = index.filter_files(pattern, digest.as_ref());
    if matched.is_empty() {
        bail!("no files matched pattern: {pattern}");
    }

    let output_dir = Path::new(output_dir);
    let mut jobs = Vec::with_capacity(matched.len());
    for file in matched {
        let Some(relative) = sanitized_relative_path(&file.path) else {
            tracing::warn!(path = %file.path, "skipping entry with unsafe path");
            continue;
        };
        jobs.push(DownloadJob {
            output_path: output_dir.join(relative),
            path: file.path,
            blob_digest: file.blob_digest,
            size: file.size,
        });
    }
    if jobs.is_empty() {
        bail!("no files matched pattern: {pattern}");
    }

    let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();
    let bar = if no_progress {
        None
    } else {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::with_template("{msg} {bar:40.green/green.dim} {bytes}/{total_bytes}")
                .expect("static progress template")
                .progress_chars("=+-"),
        );
        if jobs.len() == 1 {
            bar.set_message(format!("Downloading {}", jobs[0].path));
        } else {
            bar.set_message(format!("Downloading {} files", jobs.len()));
        }
        Some(bar)
    };

    let progress_bar = bar.clone();
    let progress = progress_bar.map(|bar| move |current: u64, _total: u64| bar.set_position(current));

    let status_bar = bar.clone();
    let many_files = jobs.len() > 1;
    let opts = DownloadOptions {
        concurrency,
        on_status: status_bar.map(|bar| {
            Arc::new(move |active: &[String], completed: usize, total: usize| {
                if active.is_empty() {
                    bar.set_message(format!("Completed {completed}/{total} files"));
                } else if many_files {
                    let names: Vec<&str> = active
                        .iter()
                        .take(3)
                        .map(|p| p.rsplit('/').next().unwrap_or(p))
                        .collect();
                    bar.set_message(format!(
                        "Downloading {}... ({completed}/{total} files)",
                        names.join(", ")
                    ));
                }
            }) as Arc<stargz_fetch::StatusFn>
        }),
        ..DownloadOptions::default()
    };

    let downloader = Downloader::new(resolver, storage);
    let stats = downloader
        .start_download(
            &jobs,
            progress
                .as_ref()
                .map(|p| p as &(dyn Fn(u64, u64) + Send + Sync)),
            &opts,
        )
        .map_err(coded)?;

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    let mut summary = format!(
        "Successfully downloaded {}/{} files ({} bytes total)",
        stats.downloaded_files, stats.total_files, stats.downloaded_bytes
    );
    if stats.failed_files > 0 {
        summary.push_str(&format!(" ({} failed)", stats.failed_files));
    }
    if stats.retries > 0 {
        summary.push_str(&format!(" ({} retries)", stats.retries));
    }
    println!("{summary}");

    if stats.failed_files > 0 {
        bail!("{} of {} files failed to download", stats.failed_files, stats.total_files);
    }

    Ok(())
}

/// Strip leading slashes and refuse paths that could escape the output
/// directory.
fn sanitized_relative_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
