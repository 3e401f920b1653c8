//! Shared fixtures for integration tests: an in-memory stargz builder and
//! an in-process registry server speaking just enough of the distribution
//! protocol (blob endpoint, redirects, ranged GETs with multipart
//! responses, optional bearer-token auth).
#![allow(dead_code)]

use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use stargz_store::{Toc, TocEntry, TocEntryType, NO_PREFETCH_LANDMARK, PREFETCH_LANDMARK};

// ---------------------------------------------------------------------------
// Stargz fixture builder
// ---------------------------------------------------------------------------

enum BuilderEntry {
    File {
        name: String,
        data: Vec<u8>,
        chunk_size: Option<usize>,
    },
    PrefetchLandmark,
    NoPrefetchLandmark,
}

/// Builds a stargz blob: per-chunk gzip members, landmark entries, a TOC
/// member and the 47-byte footer.
#[derive(Default)]
pub struct StargzBuilder {
    entries: Vec<BuilderEntry>,
}

impl StargzBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(mut self, name: &str, data: &[u8], chunk_size: Option<usize>) -> Self {
        self.entries.push(BuilderEntry::File {
            name: name.to_string(),
            data: data.to_vec(),
            chunk_size,
        });
        self
    }

    pub fn add_prefetch_landmark(mut self) -> Self {
        self.entries.push(BuilderEntry::PrefetchLandmark);
        self
    }

    pub fn add_no_prefetch_landmark(mut self) -> Self {
        self.entries.push(BuilderEntry::NoPrefetchLandmark);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut blob = Vec::new();
        let mut toc_entries = Vec::new();

        for entry in &self.entries {
            let (name, data, chunk_size) = match entry {
                BuilderEntry::File {
                    name,
                    data,
                    chunk_size,
                } => (
                    name.as_str(),
                    data.clone(),
                    chunk_size.unwrap_or_else(|| data.len().max(1)),
                ),
                BuilderEntry::PrefetchLandmark => (PREFETCH_LANDMARK, vec![0xf], 1),
                BuilderEntry::NoPrefetchLandmark => (NO_PREFETCH_LANDMARK, vec![0xf], 1),
            };

            blob.extend_from_slice(&gzip_member(&tar_header_bytes(name, data.len())));

            if data.is_empty() {
                toc_entries.push(reg_entry(name, &data, blob.len() as u64, 0));
                continue;
            }

            let chunk_count = data.len().div_ceil(chunk_size);
            for index in 0..chunk_count {
                let start = index * chunk_size;
                let end = (start + chunk_size).min(data.len());
                let member_offset = blob.len() as u64;

                let mut payload = data[start..end].to_vec();
                if end == data.len() {
                    // Tar content padding rides in the last chunk's member.
                    let padded = data.len().div_ceil(512) * 512;
                    payload.resize(payload.len() + (padded - data.len()), 0);
                }
                blob.extend_from_slice(&gzip_member(&payload));

                if index == 0 {
                    let declared_chunk_size = if chunk_count > 1 { chunk_size as u64 } else { 0 };
                    toc_entries.push(reg_entry(name, &data, member_offset, declared_chunk_size));
                } else {
                    toc_entries.push(chunk_entry(
                        name,
                        member_offset,
                        start as u64,
                        (end - start) as u64,
                    ));
                }
            }
        }

        let toc_offset = blob.len() as u64;
        let toc_json = serde_json::to_vec(&Toc {
            version: 1,
            entries: toc_entries,
        })
        .expect("TOC serializes");

        let mut toc_tar = tar_header_bytes(stargz_store::TOC_TAR_NAME, toc_json.len());
        toc_tar.extend_from_slice(&toc_json);
        let padded = toc_json.len().div_ceil(512) * 512;
        toc_tar.resize(512 + padded, 0);
        // End-of-archive marker.
        toc_tar.extend_from_slice(&[0u8; 1024]);
        blob.extend_from_slice(&gzip_member(&toc_tar));

        blob.extend_from_slice(&footer_bytes(toc_offset));
        blob
    }
}

/// `sha256:<hex>` digest of file content, as recorded in the TOC.
pub fn file_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn reg_entry(name: &str, data: &[u8], offset: u64, chunk_size: u64) -> TocEntry {
    TocEntry {
        name: name.to_string(),
        entry_type: TocEntryType::Reg,
        size: data.len() as u64,
        modtime: None,
        link_name: None,
        mode: 0o644,
        uid: 0,
        gid: 0,
        uname: None,
        gname: None,
        dev_major: 0,
        dev_minor: 0,
        xattrs: None,
        digest: Some(file_digest(data)),
        offset,
        chunk_offset: 0,
        chunk_size,
    }
}

fn chunk_entry(name: &str, offset: u64, chunk_offset: u64, chunk_size: u64) -> TocEntry {
    TocEntry {
        name: name.to_string(),
        entry_type: TocEntryType::Chunk,
        size: 0,
        modtime: None,
        link_name: None,
        mode: 0,
        uid: 0,
        gid: 0,
        uname: None,
        gname: None,
        dev_major: 0,
        dev_minor: 0,
        xattrs: None,
        digest: None,
        offset,
        chunk_offset,
        chunk_size,
    }
}

fn tar_header_bytes(name: &str, size: usize) -> Vec<u8> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name).expect("short fixture path");
    header.set_size(size as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    header.as_bytes().to_vec()
}

fn gzip_member(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

fn footer_bytes(toc_offset: u64) -> Vec<u8> {
    let mut footer = Vec::with_capacity(47);
    footer.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    footer.extend_from_slice(&22u16.to_le_bytes());
    footer.extend_from_slice(format!("{toc_offset:016x}").as_bytes());
    footer.extend_from_slice(b"STARGZ");
    footer.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    footer.extend_from_slice(&[0; 8]);
    assert_eq!(footer.len(), 47);
    footer
}

// ---------------------------------------------------------------------------
// In-process registry server
// ---------------------------------------------------------------------------

/// How the blob endpoint behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEndpoint {
    /// Serve ranged reads directly on the `/v2/.../blobs/...` URL.
    Direct,
    /// Redirect the blob endpoint to an unauthenticated `/data` URL.
    Redirect,
    /// Answer every blob request with this status.
    Broken(u16),
}

#[derive(Default)]
pub struct Counters {
    pub head: AtomicUsize,
    pub get_range: AtomicUsize,
    pub get_full: AtomicUsize,
    pub token: AtomicUsize,
}

pub struct RegistryState {
    blob: RwLock<Vec<u8>>,
    endpoint: RwLock<BlobEndpoint>,
    require_token: bool,
    ignore_ranges: std::sync::atomic::AtomicBool,
    pub counters: Counters,
    pub last_range: Mutex<Option<String>>,
}

impl RegistryState {
    pub fn set_blob(&self, data: Vec<u8>) {
        *self.blob.write().unwrap() = data;
    }

    pub fn blob_len(&self) -> usize {
        self.blob.read().unwrap().len()
    }

    pub fn set_endpoint(&self, endpoint: BlobEndpoint) {
        *self.endpoint.write().unwrap() = endpoint;
    }

    /// Make the server answer every blob GET with `200 OK` and the whole
    /// body, ignoring any `Range` header.
    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges
            .store(ignore, std::sync::atomic::Ordering::SeqCst);
    }
}

pub struct RegistryServer {
    pub host: String,
    pub state: Arc<RegistryState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RegistryServer {
    /// Start a registry serving `blob` for any repository/digest pair.
    pub async fn start(blob: Vec<u8>, endpoint: BlobEndpoint, require_token: bool) -> Self {
        let state = Arc::new(RegistryState {
            blob: RwLock::new(blob),
            endpoint: RwLock::new(endpoint),
            require_token,
            ignore_ranges: std::sync::atomic::AtomicBool::new(false),
            counters: Counters::default(),
            last_range: Mutex::new(None),
        });

        let make_svc = {
            let state = state.clone();
            make_service_fn(move |_conn| {
                let state = state.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone())))
                }
            })
        };

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let builder = Server::try_bind(&addr).expect("bind test registry");
        let local_addr = builder.local_addr();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = builder.serve(make_svc).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        tokio::spawn(server);

        Self {
            host: format!("127.0.0.1:{}", local_addr.port()),
            state,
            shutdown: Some(shutdown_tx),
        }
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

const TEST_TOKEN: &str = "test-pull-token";
const MULTIPART_BOUNDARY: &str = "RANGE_BOUNDARY";

async fn handle(
    req: Request<Body>,
    state: Arc<RegistryState>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();

    if path == "/token" {
        state.counters.token.fetch_add(1, Ordering::SeqCst);
        let body = format!("{{\"token\":\"{TEST_TOKEN}\"}}");
        let resp = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap();
        return Ok(resp);
    }

    if path == "/v2/" {
        if state.require_token && !authorized(&req) {
            let challenge =
                format!("Bearer realm=\"http://{host}/token\",service=\"test-registry\"");
            let resp = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("WWW-Authenticate", challenge)
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }
        return Ok(Response::new(Body::empty()));
    }

    if path == "/data" {
        return Ok(serve_blob(&req, &state));
    }

    if path.starts_with("/v2/") && path.contains("/blobs/") {
        if state.require_token && !authorized(&req) {
            let resp = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }
        let endpoint = *state.endpoint.read().unwrap();
        return Ok(match endpoint {
            BlobEndpoint::Broken(status) => Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .body(Body::empty())
                .unwrap(),
            BlobEndpoint::Redirect => Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header("Location", format!("http://{host}/data"))
                .body(Body::empty())
                .unwrap(),
            BlobEndpoint::Direct => serve_blob(&req, &state),
        });
    }

    let resp = Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap();
    Ok(resp)
}

fn authorized(req: &Request<Body>) -> bool {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TEST_TOKEN}"))
        .unwrap_or(false)
}

fn serve_blob(req: &Request<Body>, state: &RegistryState) -> Response<Body> {
    let blob = state.blob.read().unwrap().clone();
    let total = blob.len() as u64;

    if req.method() == Method::HEAD {
        state.counters.head.fetch_add(1, Ordering::SeqCst);
        return Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", total.to_string())
            .header("Accept-Ranges", "bytes")
            .body(Body::empty())
            .unwrap();
    }

    let range_header = req
        .headers()
        .get(hyper::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if state
        .ignore_ranges
        .load(std::sync::atomic::Ordering::SeqCst)
    {
        if let Some(range_header) = &range_header {
            *state.last_range.lock().unwrap() = Some(range_header.clone());
        }
        state.counters.get_full.fetch_add(1, Ordering::SeqCst);
        return Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", total.to_string())
            .body(Body::from(blob))
            .unwrap();
    }

    let Some(range_header) = range_header else {
        state.counters.get_full.fetch_add(1, Ordering::SeqCst);
        return Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", total.to_string())
            .body(Body::from(blob))
            .unwrap();
    };

    state.counters.get_range.fetch_add(1, Ordering::SeqCst);
    *state.last_range.lock().unwrap() = Some(range_header.clone());

    let Some(ranges) = parse_ranges(&range_header, total) else {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .body(Body::empty())
            .unwrap();
    };

    if ranges.len() == 1 {
        let (start, end) = ranges[0];
        let body = blob[start as usize..=end as usize].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header("Content-Range", format!("bytes {start}-{end}/{total}"))
            .header("Content-Length", body.len().to_string())
            .body(Body::from(body))
            .unwrap();
    }

    let mut body = Vec::new();
    for (start, end) in &ranges {
        body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Type: application/octet-stream\r\nContent-Range: bytes {start}-{end}/{total}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&blob[*start as usize..=*end as usize]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(
            "Content-Type",
            format!("multipart/byteranges; boundary={MULTIPART_BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn parse_ranges(header: &str, total: u64) -> Option<Vec<(u64, u64)>> {
    let specs = header.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();
    for spec in specs.split(',') {
        let (start, end) = spec.trim().split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = end.parse().ok()?;
        if start >= total || end < start {
            return None;
        }
        ranges.push((start, end.min(total - 1)));
    }
    if ranges.is_empty() {
        return None;
    }
    Some(ranges)
}

/// A `127.0.0.1` port with nothing listening on it.
pub fn unreachable_host() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    format!("127.0.0.1:{port}")
}
