//! End-to-end scenarios over synthetic eStargz blobs.
//!
//! These tests exercise the full stack - blob bytes through footer/TOC
//! decoding, index building, and chunked downloads - against in-memory
//! storage, plus the registry auth handshake against a local HTTP listener.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;

use stargz_fetch::testutil::BlobBuilder;
use stargz_fetch::{
    BlobDescriptor, BlobResolver, BlobStorage, ContentDigest, DownloadJob, DownloadOptions,
    Downloader, ImageReference, IndexLoader, MemoryStorage, RegistryClient, TocResolver,
};
use tempfile::TempDir;

fn jobs_for(
    index: &stargz_fetch::ImageIndex,
    pattern: &str,
    output_dir: &std::path::Path,
) -> Vec<DownloadJob> {
    index
        .filter_files(pattern, None)
        .into_iter()
        .map(|file| DownloadJob {
            output_path: output_dir.join(&file.path),
            path: file.path,
            blob_digest: file.blob_digest,
            size: file.size,
        })
        .collect()
}

#[test]
fn test_full_stack_single_layer_download() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new()
            .file("bin/echo", b"echo content")
            .file("etc/hostname", b"devbox")
            .file("etc/empty", b"")
            .build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();

    let jobs = jobs_for(&index, "", dir.path());
    assert_eq!(jobs.len(), 3);

    let downloader = Downloader::new(resolver, storage);
    let stats = downloader
        .start_download(&jobs, None, &DownloadOptions::default())
        .unwrap();

    assert_eq!(stats.downloaded_files, 3);
    assert_eq!(stats.failed_files, 0);
    assert_eq!(
        std::fs::read(dir.path().join("bin/echo")).unwrap(),
        b"echo content"
    );
    assert_eq!(
        std::fs::read(dir.path().join("etc/hostname")).unwrap(),
        b"devbox"
    );
    assert_eq!(
        std::fs::read(dir.path().join("etc/empty")).unwrap().len(),
        0
    );
}

#[test]
fn test_overlay_download_takes_upper_layer_content() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new().file("etc/hostname", b"A").build(),
    );
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new().file("etc/hostname", b"B").build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();

    // The overlay view must resolve to the second (upper) layer.
    let info = index.find_file("etc/hostname", None).unwrap();
    assert_eq!(info.blob_digest, index.layers[1].blob_digest);

    let jobs = jobs_for(&index, "etc/hostname", dir.path());
    let downloader = Downloader::new(resolver, storage);
    let stats = downloader
        .start_download(&jobs, None, &DownloadOptions::default())
        .unwrap();

    assert_eq!(stats.downloaded_files, 1);
    assert_eq!(
        std::fs::read(dir.path().join("etc/hostname")).unwrap(),
        b"B"
    );
}

#[test]
fn test_chunked_file_via_real_toc() {
    let dir = TempDir::new().unwrap();
    let content: Vec<u8> = b"0123456789abcdef".repeat(40); // 640 bytes
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new()
            .chunked_file("usr/bin/bash", &content, 128)
            .build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let metadata = {
        let blobs = storage.list_blobs().unwrap();
        resolver
            .file_metadata(&blobs[0].digest, "usr/bin/bash")
            .unwrap()
    };
    assert_eq!(metadata.chunks.len(), 5);
    assert_eq!(metadata.size, 640);

    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();
    let jobs = jobs_for(&index, "usr/bin/bash", dir.path());

    let opts = DownloadOptions {
        concurrency: 4,
        single_file_chunk_threshold: 256,
        ..DownloadOptions::default()
    };
    let downloader = Downloader::new(resolver, storage);
    let stats = downloader.start_download(&jobs, None, &opts).unwrap();

    assert_eq!(stats.downloaded_files, 1);
    assert_eq!(stats.downloaded_bytes, 640);
    assert_eq!(
        std::fs::read(dir.path().join("usr/bin/bash")).unwrap(),
        content
    );
}

#[test]
fn test_chunked_and_serial_outputs_are_identical() {
    let content: Vec<u8> = (0u8..=255).cycle().take(2000).collect();
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new().chunked_file("data.bin", &content, 256).build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();

    let mut outputs = Vec::new();
    for threshold in [1u64, 1 << 30] {
        let dir = TempDir::new().unwrap();
        let jobs = jobs_for(&index, "data.bin", dir.path());
        let opts = DownloadOptions {
            concurrency: 4,
            single_file_chunk_threshold: threshold,
            ..DownloadOptions::default()
        };
        Downloader::new(resolver.clone(), storage.clone())
            .start_download(&jobs, None, &opts)
            .unwrap();
        outputs.push(std::fs::read(dir.path().join("data.bin")).unwrap());
    }

    assert_eq!(outputs[0], content);
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_legacy_footer_blob_behaves_like_modern() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new()
            .file("bin/echo", b"legacy blob content")
            .legacy_footer()
            .build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();
    assert_eq!(index.all_files(), vec!["bin/echo"]);

    let jobs = jobs_for(&index, "bin/echo", dir.path());
    let stats = Downloader::new(resolver, storage)
        .start_download(&jobs, None, &DownloadOptions::default())
        .unwrap();

    assert_eq!(stats.downloaded_files, 1);
    assert_eq!(
        std::fs::read(dir.path().join("bin/echo")).unwrap(),
        b"legacy blob content"
    );
}

#[test]
fn test_progress_is_monotonic_per_job_and_reaches_total() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new()
            .chunked_file("a", &[1u8; 500], 100)
            .chunked_file("b", &[2u8; 300], 100)
            .build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver.clone())
        .load()
        .unwrap();
    let mut jobs = jobs_for(&index, "", dir.path());
    jobs.sort_by(|a, b| a.path.cmp(&b.path));

    let seen = Arc::new(std::sync::Mutex::new(Vec::<(u64, u64)>::new()));
    let stats = {
        let seen = Arc::clone(&seen);
        Downloader::new(resolver, storage)
            .start_download(
                &jobs,
                Some(&move |current, total| seen.lock().unwrap().push((current, total))),
                &DownloadOptions::default(),
            )
            .unwrap()
    };

    assert_eq!(stats.downloaded_bytes, 800);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().copied(), Some((0, 800)));
    assert!(seen.iter().all(|&(current, total)| {
        total == 800 && current <= total
    }));
    assert_eq!(seen.iter().map(|&(c, _)| c).max(), Some(800));
}

/// Minimal canned-response registry speaking just enough HTTP/1.1 for ureq.
///
/// Serves a manifest behind a bearer-token challenge: the first manifest
/// request (no Authorization) gets a 401 naming this server as the token
/// realm; the token endpoint returns a fixed token; a manifest request
/// bearing that token succeeds.
struct FakeRegistry {
    port: u16,
    handle: Option<std::thread::JoinHandle<Vec<String>>>,
}

impl FakeRegistry {
    fn start(manifest_json: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let mut request_log = Vec::new();
            // manifest (401) -> token -> manifest (200)
            for _ in 0..3 {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let target = request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("")
                    .to_string();

                let mut authorization = String::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some(value) = line
                        .to_ascii_lowercase()
                        .strip_prefix("authorization:")
                        .map(str::trim)
                    {
                        authorization = value.to_string();
                    }
                }
                request_log.push(format!("{target} auth={authorization}"));

                let response = if target.starts_with("/token") {
                    ok_json(r#"{"token":"goodtoken"}"#)
                } else if authorization == "bearer goodtoken" {
                    ok_json(&manifest_json)
                } else {
                    unauthorized(port)
                };

                let mut stream = reader.into_inner();
                stream.write_all(response.as_bytes()).unwrap();
            }
            request_log
        });

        FakeRegistry {
            port,
            handle: Some(handle),
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.handle.take().unwrap().join().unwrap()
    }
}

fn ok_json(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn unauthorized(port: u16) -> String {
    format!(
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Bearer realm=\"http://127.0.0.1:{port}/token\", service=\"registry.test\", scope=\"repository:test/repo:pull\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

#[test]
fn test_bearer_challenge_handshake() {
    let layer_digest = format!("sha256:{}", "ab".repeat(32));
    let manifest_json = format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"{layer_digest}","size":1234}}]}}"#
    );
    let registry = FakeRegistry::start(manifest_json);
    let port = registry.port;

    let reference = ImageReference::parse(&format!("127.0.0.1:{port}/test/repo:latest")).unwrap();
    let client = RegistryClient::new();
    let manifest = client.fetch_manifest(&reference).unwrap();

    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.layers[0].digest, layer_digest);
    assert_eq!(manifest.layers[0].size, 1234);

    let log = registry.finish();
    assert_eq!(log.len(), 3);
    // Anonymous first, even though the server will challenge.
    assert_eq!(log[0], "/v2/test/repo/manifests/latest auth=");
    assert!(log[1].starts_with("/token?service=registry.test&scope=repository:test/repo:pull"));
    assert_eq!(log[2], "/v2/test/repo/manifests/latest auth=bearer goodtoken");
}

#[test]
fn test_filter_and_find_against_full_stack() {
    let storage = Arc::new(MemoryStorage::new());
    let blob = storage.add_blob(
        "application/vnd.oci.image.layer.v1.tar+gzip",
        &BlobBuilder::new()
            .file("bin/echo", b"echo")
            .file("bin/cat", b"cat")
            .file("usr/share/doc/README", b"docs")
            .build(),
    );

    let resolver = Arc::new(TocResolver::new(storage.clone()));
    let index = IndexLoader::new(storage.clone(), resolver).load().unwrap();

    let mut bins: Vec<String> = index
        .filter_files("bin/", None)
        .into_iter()
        .map(|f| f.path)
        .collect();
    bins.sort();
    assert_eq!(bins, vec!["bin/cat", "bin/echo"]);

    let found = index.find_file("usr/share/doc/README", Some(&blob)).unwrap();
    assert_eq!(found.size, 4);

    let missing = ContentDigest::from_bytes(b"not a blob");
    assert!(index.filter_files("bin/", Some(&missing)).is_empty());
}

/// Blob descriptors reported by storage must stay in manifest order even
/// when lookups interleave.
#[test]
fn test_blob_listing_order_is_stable() {
    let storage = MemoryStorage::new();
    let mut expected = Vec::new();
    for i in 0..5u8 {
        let blob = BlobBuilder::new()
            .file(&format!("file{i}"), &[i; 10])
            .build();
        expected.push(storage.add_blob("application/test", &blob));
    }

    for _ in 0..3 {
        let listed: Vec<ContentDigest> = storage
            .list_blobs()
            .unwrap()
            .into_iter()
            .map(|b: BlobDescriptor| b.digest)
            .collect();
        assert_eq!(listed, expected);
    }
}
