//! Byte-range fetching against a resolved blob URL.
//!
//! A [`Fetcher`] is bound to one blob URL and one authenticated transport.
//! It services a set of disjoint regions in a single HTTP request: the
//! `Range` header always leads with a dummy `0-0` range so the server is
//! obliged to answer with a `multipart/byteranges` body even for a single
//! requested range, which folds the raw-206 and multipart-206 cases into
//! one parser.
//!
//! A server may instead answer `200 OK` with the whole blob; that response
//! is returned as a single region covering the blob. The fetcher returns
//! whatever regions the server produced and leaves reconciliation with the
//! requested set to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Method, StatusCode};

use crate::error::{Result, StoreError};
use crate::keychain::AuthTransport;
use crate::region::{parse_content_range, Region};

/// Deadline for metadata round-trips (redirect, size probe, liveness).
pub(crate) const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for bulk range fetches.
pub(crate) const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-supplied overrides for a single fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Overall deadline superseding the 30-second default.
    pub timeout: Option<Duration>,
}

/// Range fetcher bound to a resolved blob URL.
#[derive(Debug)]
pub(crate) struct Fetcher {
    pub(crate) url: String,
    pub(crate) transport: Arc<AuthTransport>,
}

impl Fetcher {
    /// Fetch a set of regions in one request, returning a mapping from the
    /// regions the server actually produced to their bytes.
    pub(crate) async fn fetch(
        &self,
        requests: &[Region],
        options: &FetchOptions,
    ) -> Result<HashMap<Region, Vec<u8>>> {
        let mut fetched = HashMap::new();
        if requests.is_empty() {
            return Ok(fetched);
        }

        // Dummy leading range forces a multipart response.
        let mut ranges = String::from("bytes=0-0");
        for region in requests {
            ranges.push_str(&format!(",{}-{}", region.begin, region.end));
        }

        let response = self
            .transport
            .request(Method::GET, &self.url)
            .header(header::RANGE, ranges)
            .header(header::ACCEPT_ENCODING, "identity")
            .timeout(options.timeout.unwrap_or(FETCH_TIMEOUT))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                // The server ignored the ranges and sent the whole blob.
                let declared = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let data = response.bytes().await?.to_vec();
                if let Some(declared) = declared {
                    if declared != data.len() as u64 {
                        return Err(StoreError::SizeMismatch {
                            url: self.url.clone(),
                            expected: declared,
                            actual: data.len() as u64,
                        });
                    }
                }
                if !data.is_empty() {
                    fetched.insert(Region::new(0, data.len() as u64 - 1), data);
                }
                Ok(fetched)
            }
            StatusCode::PARTIAL_CONTENT => {
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let boundary = multipart_boundary(&content_type).ok_or_else(|| {
                    StoreError::UnexpectedMediaType {
                        url: self.url.clone(),
                        content_type: content_type.clone(),
                    }
                })?;

                let body = response.bytes().await?;
                let mut parts = parse_multipart(&body, &boundary)?.into_iter();
                // The first part answers the dummy range.
                parts.next();

                for part in parts {
                    let header = part.content_range.ok_or_else(|| {
                        StoreError::MalformedRange("part without Content-Range".to_string())
                    })?;
                    let region = parse_content_range(&header)?;
                    if part.data.len() as u64 != region.size() {
                        return Err(StoreError::SizeMismatch {
                            url: self.url.clone(),
                            expected: region.size(),
                            actual: part.data.len() as u64,
                        });
                    }
                    fetched.insert(region, part.data);
                }
                Ok(fetched)
            }
            status => Err(StoreError::FetchFailed {
                url: self.url.clone(),
                status: status.as_u16(),
            }),
        }
    }

    /// Probe whether the resolved URL still serves the blob.
    ///
    /// Uses a two-byte ranged GET rather than HEAD; some registries only
    /// answer range probes on the GET path.
    pub(crate) async fn check(&self) -> Result<()> {
        let response = self
            .transport
            .request(Method::GET, &self.url)
            .header(header::RANGE, "bytes=0-1")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let _ = response.bytes().await;

        if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
            Ok(())
        } else {
            Err(StoreError::CheckFailed {
                url: self.url.clone(),
                status: status.as_u16(),
            })
        }
    }

    /// Cache ID for a raw region of this blob.
    pub(crate) fn gen_id(&self, region: Region) -> String {
        crate::cache::chunk_id(&self.url, region.begin, region.end)
    }
}

/// Resolve the blob endpoint to its final URL.
///
/// A single redirect hop is followed by taking the `Location` header
/// verbatim; nested redirects are not chased.
pub(crate) async fn redirect(endpoint_url: &str, transport: &AuthTransport) -> Result<String> {
    let response = transport
        .request(Method::GET, endpoint_url)
        .header(header::RANGE, "bytes=0-1")
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?;
    let status = response.status();
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let _ = response.bytes().await;

    if status.is_success() {
        Ok(endpoint_url.to_string())
    } else if status.is_redirection() {
        location.ok_or(StoreError::RedirectFailed {
            url: endpoint_url.to_string(),
            status: status.as_u16(),
        })
    } else {
        Err(StoreError::RedirectFailed {
            url: endpoint_url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Determine the blob size from a HEAD request against the resolved URL.
pub(crate) async fn get_size(url: &str, transport: &AuthTransport) -> Result<u64> {
    let response = transport
        .request(Method::HEAD, url)
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(StoreError::SizeProbeFailed {
            url: url.to_string(),
            reason: format!("HEAD request answered {status}"),
        });
    }
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| StoreError::SizeProbeFailed {
            url: url.to_string(),
            reason: "missing or invalid Content-Length".to_string(),
        })
}

/// Extract the boundary parameter from a `multipart/...` media type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let media_type = parts.next()?.trim();
    if !media_type
        .to_ascii_lowercase()
        .starts_with("multipart/")
    {
        return None;
    }
    for param in parts {
        if let Some(value) = param.trim().strip_prefix("boundary=") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

struct MultipartPart {
    content_range: Option<String>,
    data: Vec<u8>,
}

/// Parse a `multipart/byteranges` body into its parts, in order.
fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>> {
    let delimiter = format!("--{boundary}");
    let closing = b"--";

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter.as_bytes()).ok_or_else(|| {
        StoreError::MalformedRange("multipart body without boundary".to_string())
    })? + delimiter.len();

    loop {
        if body[pos..].starts_with(closing) {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let headers_end = find(&body[pos..], b"\r\n\r\n").ok_or_else(|| {
            StoreError::MalformedRange("multipart part without header block".to_string())
        })? + pos;
        let content_range = parse_part_headers(&body[pos..headers_end]);

        let data_start = headers_end + 4;
        let needle = format!("\r\n--{boundary}");
        let data_len = find(&body[data_start..], needle.as_bytes()).ok_or_else(|| {
            StoreError::MalformedRange("unterminated multipart part".to_string())
        })?;

        parts.push(MultipartPart {
            content_range,
            data: body[data_start..data_start + data_len].to_vec(),
        });
        pos = data_start + data_len + needle.len();
    }

    Ok(parts)
}

fn parse_part_headers(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-range") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
