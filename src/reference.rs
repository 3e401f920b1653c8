//! Image reference parsing.
//!
//! A reference names a repository on a registry, optionally pinned to a tag
//! or digest: `registry.example.com/ns/app:v1` or
//! `ubuntu@sha256:...`. Docker-style normalization applies: a missing
//! domain defaults to `docker.io`, and single-segment repositories on the
//! default domain gain the `library/` prefix.
//!
//! The resolver re-parses references with each candidate mirror host
//! substituted for the domain, so parsing has to accept `host:port`
//! domains and carry the insecure (plain HTTP) flag chosen per mirror.

use crate::error::{Result, StoreError};

/// Domain assumed when a reference carries none.
pub const DEFAULT_DOMAIN: &str = "docker.io";

const OFFICIAL_REPOSITORY_PREFIX: &str = "library/";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
    insecure: bool,
}

impl Reference {
    /// Parse a reference, assuming HTTPS transport.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_with(reference, false)
    }

    /// Parse a reference, selecting plain HTTP when `insecure` is set.
    pub fn parse_with(reference: &str, insecure: bool) -> Result<Self> {
        let invalid = || StoreError::InvalidReference(reference.to_string());

        if reference.trim().is_empty() {
            return Err(invalid());
        }

        let (without_digest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest).ok_or_else(invalid)?;
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (without_tag, tag) = match without_digest.rsplit_once(':') {
            // A colon inside the final path segment is a tag; a colon in the
            // first segment belongs to a registry port.
            Some((rest, candidate)) if !candidate.contains('/') && !rest.is_empty() => {
                validate_tag(candidate).ok_or_else(invalid)?;
                (rest, Some(candidate.to_string()))
            }
            _ => (without_digest, None),
        };

        let (domain, path) = split_domain(without_tag);
        validate_domain(&domain).ok_or_else(invalid)?;
        validate_path(&path).ok_or_else(invalid)?;

        Ok(Self {
            domain,
            path,
            tag,
            digest,
            insecure,
        })
    }

    /// Registry domain, possibly with a port.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path below the domain.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tag, when one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, when one was given.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// URL scheme matching the insecure flag.
    pub fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    /// Canonical `domain/path` name; the transport pool key.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }
}

fn split_domain(reference: &str) -> (String, String) {
    match reference.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_DOMAIN.to_string(), reference.to_string()),
        None => (
            DEFAULT_DOMAIN.to_string(),
            format!("{OFFICIAL_REPOSITORY_PREFIX}{reference}"),
        ),
    }
}

fn validate_domain(domain: &str) -> Option<()> {
    if domain.is_empty()
        || !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
    {
        return None;
    }
    Some(())
}

fn validate_path(path: &str) -> Option<()> {
    if path.is_empty() {
        return None;
    }
    for segment in path.split('/') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return None;
        }
    }
    Some(())
}

fn validate_tag(tag: &str) -> Option<()> {
    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return None;
    }
    Some(())
}

fn validate_digest(digest: &str) -> Option<()> {
    let hex = digest.strip_prefix("sha256:")?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(())
}
