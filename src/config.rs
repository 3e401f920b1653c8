//! Configuration for resolution and per-blob runtime behavior.
//!
//! The resolver is configured per registry domain: an ordered list of
//! mirror hosts, each optionally marked insecure (plain HTTP). The origin
//! domain itself is always tried last, so an empty configuration simply
//! means "go straight to the origin".
//!
//! Per-blob settings control the fetch granularity and how often the
//! resolved blob URL is re-checked for liveness.
//!
//! # Configuration Structure
//!
//! A typical configuration file looks like:
//! ```toml
//! [resolver."registry.example.com"]
//! mirrors = [
//!     { host = "mirror-a.example.com" },
//!     { host = "mirror-b.internal:5000", insecure = true },
//! ]
//!
//! [blob]
//! chunk_size = 50000
//! valid_interval = 60
//! ```
//!
//! Zero values mean "use the default": chunk size 50 000 bytes, validity
//! interval 60 seconds. `check_always` forces a liveness probe on every
//! access regardless of the interval.
//!
//! Locating and reading the file is the embedding application's job; this
//! module only parses content handed to it.

use std::collections::HashMap;

use serde::Deserialize;

/// Full configuration document: per-domain resolver settings plus blob
/// runtime defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Resolver configuration keyed by registry domain.
    #[serde(default)]
    pub resolver: HashMap<String, ResolverConfig>,

    /// Per-blob runtime settings.
    #[serde(default)]
    pub blob: BlobConfig,
}

/// Resolution settings for one registry domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResolverConfig {
    /// Mirror hosts tried in order before the origin domain.
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

/// A single mirror host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MirrorConfig {
    /// Host (and optional port) serving the same blobs as the origin.
    pub host: String,

    /// Use plain HTTP when talking to this host.
    #[serde(default)]
    pub insecure: bool,
}

/// Per-blob runtime settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BlobConfig {
    /// Seconds the resolved URL is trusted before a liveness re-check.
    /// Zero means the 60-second default.
    #[serde(default)]
    pub valid_interval: u64,

    /// Probe liveness on every access, ignoring `valid_interval`.
    #[serde(default)]
    pub check_always: bool,

    /// Fetch granularity in bytes. Zero means the 50 000-byte default.
    #[serde(default)]
    pub chunk_size: u64,
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
