//! Mirror-walking blob resolution.
//!
//! Given an image reference and a layer digest, the resolver walks the
//! configured mirrors for the reference's domain (the origin domain is the
//! implicit last candidate), negotiates an authenticated transport per
//! registry, resolves the blob endpoint through at most one redirect hop,
//! probes the blob size, and hands back a [`Blob`] bound to the winning
//! fetcher.
//!
//! Authenticated transports are pooled per `domain/path` reference name. A
//! pooled transport is tried first; when it no longer works (expired token,
//! restarted registry) it is replaced by a freshly negotiated one. The pool
//! lock spans the whole lookup-negotiate-store sequence so concurrent
//! resolves cannot lose an update.
//!
//! Per-host failures are accumulated; the first host that completes every
//! step wins and earlier failures are discarded. Only when every candidate
//! fails does [`StoreError::ResolveFailed`] surface, carrying the context
//! of each attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use crate::blob::Blob;
use crate::cache::ChunkCache;
use crate::config::{BlobConfig, MirrorConfig, ResolverConfig};
use crate::error::{Result, StoreError};
use crate::fetcher::{self, Fetcher};
use crate::keychain::{AuthTransport, Keychain};
use crate::reference::Reference;

/// Fetch granularity used when the blob configuration leaves it zero.
pub const DEFAULT_CHUNK_SIZE: u64 = 50_000;

/// Liveness window used when the blob configuration leaves it zero.
pub const DEFAULT_VALID_INTERVAL: Duration = Duration::from_secs(60);

/// Resolves `(reference, digest)` pairs into remote blob handles.
///
/// Cloning is cheap; every clone shares the transport pool. Each resolved
/// [`Blob`] keeps a clone so the read path can re-resolve its fetcher when
/// a liveness check fails.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    client: Client,
    transport_pool: Mutex<HashMap<String, Arc<AuthTransport>>>,
    keychain: Arc<dyn Keychain>,
    config: HashMap<String, ResolverConfig>,
}

impl Resolver {
    /// Create a resolver with the given keychain and per-domain mirror
    /// configuration.
    pub fn new(
        keychain: Arc<dyn Keychain>,
        config: HashMap<String, ResolverConfig>,
    ) -> Result<Self> {
        // Redirects are resolved by hand so the final URL can be recorded.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            inner: Arc::new(ResolverInner {
                client,
                transport_pool: Mutex::new(HashMap::new()),
                keychain,
                config,
            }),
        })
    }

    /// Resolve a layer blob, returning a handle bound to the first mirror
    /// that serves it.
    pub async fn resolve(
        &self,
        reference: &str,
        digest: &str,
        cache: Arc<dyn ChunkCache>,
        config: &BlobConfig,
    ) -> Result<Blob> {
        let (fetcher, size) = self.resolve_fetcher(reference, digest).await?;

        let chunk_size = if config.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            config.chunk_size
        };
        let check_interval = if config.check_always {
            Duration::ZERO
        } else if config.valid_interval == 0 {
            DEFAULT_VALID_INTERVAL
        } else {
            Duration::from_secs(config.valid_interval)
        };

        Ok(Blob::new(
            self.clone(),
            reference.to_string(),
            digest.to_string(),
            fetcher,
            size,
            chunk_size,
            check_interval,
            cache,
        ))
    }

    /// Re-resolve a blob's fetcher in place.
    ///
    /// Fails with [`StoreError::SizeChanged`] when the re-resolved blob
    /// reports a different size, leaving the original fetcher installed.
    pub async fn refresh(&self, blob: &Blob) -> Result<()> {
        blob.refresh_fetcher().await
    }

    pub(crate) async fn resolve_fetcher(
        &self,
        reference: &str,
        digest: &str,
    ) -> Result<(Fetcher, u64)> {
        let named = Reference::parse(reference)?;

        let mut hosts = self
            .inner
            .config
            .get(named.domain())
            .map(|c| c.mirrors.clone())
            .unwrap_or_default();
        hosts.push(MirrorConfig {
            host: named.domain().to_string(),
            insecure: false,
        });

        let mut attempts = Vec::new();
        for mirror in hosts {
            if mirror.host.is_empty() || mirror.host.contains('/') {
                attempts.push(format!(
                    "host {:?}: mirror must be a domain name",
                    mirror.host
                ));
                continue;
            }

            let mirrored = format!("{}/{}", mirror.host, named.path());
            let nref = match Reference::parse_with(&mirrored, mirror.insecure) {
                Ok(nref) => nref,
                Err(err) => {
                    attempts.push(format!(
                        "host {:?}: failed to parse ref {mirrored:?} ({digest:?}): {err}",
                        mirror.host
                    ));
                    continue;
                }
            };

            let (url, transport) = match self.resolve_reference(&nref, digest).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    attempts.push(format!(
                        "host {:?}: failed to resolve ref {:?} ({digest:?}): {err}",
                        mirror.host,
                        nref.name()
                    ));
                    continue;
                }
            };

            let size = match fetcher::get_size(&url, &transport).await {
                Ok(size) => size,
                Err(err) => {
                    attempts.push(format!(
                        "host {:?}: failed to get size of {url:?}: {err}",
                        mirror.host
                    ));
                    continue;
                }
            };

            debug!(host = %mirror.host, url = %url, size, "resolved blob");
            return Ok((Fetcher { url, transport }, size));
        }

        Err(StoreError::ResolveFailed {
            reference: reference.to_string(),
            digest: digest.to_string(),
            attempts,
        })
    }

    /// Resolve the blob endpoint for one candidate registry, reusing or
    /// replacing the pooled transport for its reference name.
    async fn resolve_reference(
        &self,
        nref: &Reference,
        digest: &str,
    ) -> Result<(String, Arc<AuthTransport>)> {
        let mut pool = self.inner.transport_pool.lock().await;

        let endpoint_url = format!(
            "{}://{}/v2/{}/blobs/{}",
            nref.scheme(),
            nref.domain(),
            nref.path(),
            digest
        );

        if let Some(transport) = pool.get(&nref.name()) {
            if let Ok(url) = fetcher::redirect(&endpoint_url, transport).await {
                return Ok((url, Arc::clone(transport)));
            }
            debug!(reference = %nref.name(), "pooled transport rejected; renegotiating");
        }

        let transport = Arc::new(
            AuthTransport::new(&self.inner.client, nref, self.inner.keychain.as_ref()).await?,
        );
        let url = fetcher::redirect(&endpoint_url, &transport).await?;
        pool.insert(nref.name(), Arc::clone(&transport));

        Ok((url, transport))
    }
}
