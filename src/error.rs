//! Error types for the stargz-store library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, StoreError>`.
//!
//! # Error Categories
//!
//! - **Resolution**: [`ResolveFailed`], [`RedirectFailed`], [`SizeProbeFailed`]
//! - **Authentication**: [`AuthTimeout`], [`AuthFailed`]
//! - **Fetching**: [`FetchFailed`], [`MalformedRange`], [`SizeMismatch`],
//!   [`UnexpectedMediaType`], [`IncompleteFetch`]
//! - **Liveness**: [`CheckFailed`], [`SizeChanged`]
//! - **Layer access**: [`NoSuchEntry`], [`InvalidStargz`], [`BadLandmark`]
//! - **Prefetch**: [`PrefetchReadFailed`], [`PrefetchTimeout`]
//! - **System**: [`Http`], [`Io`], [`Json`]
//!
//! [`ResolveFailed`]: StoreError::ResolveFailed
//! [`RedirectFailed`]: StoreError::RedirectFailed
//! [`SizeProbeFailed`]: StoreError::SizeProbeFailed
//! [`AuthTimeout`]: StoreError::AuthTimeout
//! [`AuthFailed`]: StoreError::AuthFailed
//! [`FetchFailed`]: StoreError::FetchFailed
//! [`MalformedRange`]: StoreError::MalformedRange
//! [`SizeMismatch`]: StoreError::SizeMismatch
//! [`UnexpectedMediaType`]: StoreError::UnexpectedMediaType
//! [`IncompleteFetch`]: StoreError::IncompleteFetch
//! [`CheckFailed`]: StoreError::CheckFailed
//! [`SizeChanged`]: StoreError::SizeChanged
//! [`NoSuchEntry`]: StoreError::NoSuchEntry
//! [`InvalidStargz`]: StoreError::InvalidStargz
//! [`BadLandmark`]: StoreError::BadLandmark
//! [`PrefetchReadFailed`]: StoreError::PrefetchReadFailed
//! [`PrefetchTimeout`]: StoreError::PrefetchTimeout
//! [`Http`]: StoreError::Http
//! [`Io`]: StoreError::Io
//! [`Json`]: StoreError::Json
//!
//! Per-mirror failures during resolution are accumulated rather than
//! surfaced individually; [`ResolveFailed`] carries the context of every
//! attempted host so the caller can see the whole walk.

use std::time::Duration;

use crate::region::Region;

/// Result type alias for operations that may return a [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for remote layer access.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No configured mirror (nor the origin registry) yielded a usable
    /// fetcher. Carries the per-host failure context in order of attempt.
    #[error("cannot resolve ref {reference:?} ({digest:?}): {}", .attempts.join("; "))]
    ResolveFailed {
        reference: String,
        digest: String,
        attempts: Vec<String>,
    },

    /// The blob endpoint answered neither 2xx nor a redirect with a
    /// `Location` header.
    #[error("failed to access {url:?} with code {status}")]
    RedirectFailed { url: String, status: u16 },

    /// The HEAD size probe failed or returned an unusable `Content-Length`.
    #[error("failed to get size of {url:?}: {reason}")]
    SizeProbeFailed { url: String, reason: String },

    /// Credential or token acquisition exceeded the authentication budget.
    #[error("authentication timeout for {registry:?}")]
    AuthTimeout { registry: String },

    /// The registry rejected the authentication handshake.
    #[error("authentication against {registry:?} failed: {reason}")]
    AuthFailed { registry: String, reason: String },

    /// A ranged GET returned a status other than 200 or 206.
    #[error("unexpected status code {status} on {url:?}")]
    FetchFailed { url: String, status: u16 },

    /// A `Content-Range` header (or multipart framing) could not be parsed.
    #[error("malformed range: {0}")]
    MalformedRange(String),

    /// A 206 response did not carry a multipart media type with a boundary.
    #[error("invalid media type {content_type:?} for {url:?}")]
    UnexpectedMediaType { url: String, content_type: String },

    /// A response body length disagreed with the declared length.
    #[error("broken response body for {url:?}: got {actual} bytes, want {expected}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    /// A requested region was absent from the multipart response.
    #[error("fetch response did not cover requested region {region}")]
    IncompleteFetch { region: Region },

    /// Refresh observed a blob whose size differs from the one recorded at
    /// resolve time.
    #[error("invalid size of new blob {actual}; want {expected}")]
    SizeChanged { expected: u64, actual: u64 },

    /// The liveness probe answered with an unexpected status.
    #[error("check failed with status code {status} for {url:?}")]
    CheckFailed { url: String, status: u16 },

    /// Reading the prefetch prefix from the layer failed.
    #[error("failed to prefetch layer data: {0}")]
    PrefetchReadFailed(String),

    /// Waiting for prefetch completion exceeded the caller's timeout.
    #[error("prefetch timed out after {timeout:?}")]
    PrefetchTimeout { timeout: Duration },

    /// A prefetch landmark entry points beyond the layer.
    #[error("invalid landmark offset {offset} is larger than layer size {size}")]
    BadLandmark { offset: u64, size: u64 },

    /// The TOC has no entry (or no regular-file entry) under the given name.
    #[error("no such entry: {0:?}")]
    NoSuchEntry(String),

    /// The blob is not a well-formed stargz archive.
    #[error("invalid stargz: {0}")]
    InvalidStargz(String),

    /// An image reference could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during decompression or archive traversal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error (TOC document or token response).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
