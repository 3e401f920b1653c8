//! Registry credentials and authenticated transport.
//!
//! A [`Keychain`] hands out credentials per registry domain. An
//! [`AuthTransport`] wraps the shared HTTP client with whatever the
//! registry's `/v2/` ping demanded: nothing, HTTP basic, or a pull-scope
//! bearer token obtained from the `WWW-Authenticate` challenge's realm.
//!
//! The whole handshake runs under a 10-second budget; exceeding it yields
//! [`StoreError::AuthTimeout`]. Authorization is attached only to requests
//! aimed at the registry host itself, so redirect targets (presigned
//! object-storage URLs and the like) are fetched bare.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::reference::Reference;

/// Budget for the complete authentication handshake.
pub const AUTHN_TIMEOUT: Duration = Duration::from_secs(10);

/// A username/password pair for a registry.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Source of registry credentials.
pub trait Keychain: Send + Sync {
    /// Credentials for `domain`, or `None` for anonymous access.
    fn resolve(&self, domain: &str) -> Option<Credential>;
}

/// Keychain that never has credentials.
#[derive(Debug, Default)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _domain: &str) -> Option<Credential> {
        None
    }
}

/// Keychain backed by a fixed domain-to-credential map.
#[derive(Debug, Default)]
pub struct StaticKeychain {
    credentials: HashMap<String, Credential>,
}

impl StaticKeychain {
    /// Create an empty keychain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register credentials for a domain.
    pub fn insert(&mut self, domain: impl Into<String>, credential: Credential) {
        self.credentials.insert(domain.into(), credential);
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, domain: &str) -> Option<Credential> {
        self.credentials.get(domain).cloned()
    }
}

#[derive(Debug, Clone)]
enum AuthScheme {
    None,
    Basic(Credential),
    Bearer(String),
}

/// HTTP transport bound to one registry, injecting pull-scope authorization
/// on requests that target it.
#[derive(Debug, Clone)]
pub struct AuthTransport {
    client: Client,
    registry: String,
    scheme: AuthScheme,
}

impl AuthTransport {
    /// Negotiate authentication for `reference`'s registry.
    pub async fn new(
        client: &Client,
        reference: &Reference,
        keychain: &dyn Keychain,
    ) -> Result<Self> {
        let registry = reference.domain().to_string();
        match tokio::time::timeout(AUTHN_TIMEOUT, Self::handshake(client, reference, keychain))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::AuthTimeout { registry }),
        }
    }

    async fn handshake(
        client: &Client,
        reference: &Reference,
        keychain: &dyn Keychain,
    ) -> Result<Self> {
        let registry = reference.domain().to_string();
        let ping_url = format!("{}://{}/v2/", reference.scheme(), registry);

        let response = client.get(&ping_url).send().await?;
        let status = response.status();

        let scheme = if status.is_success() {
            AuthScheme::None
        } else if status == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StoreError::AuthFailed {
                    registry: registry.clone(),
                    reason: "401 without WWW-Authenticate challenge".to_string(),
                })?;
            let _ = response.bytes().await;

            match parse_challenge(&challenge) {
                Some(Challenge::Basic) => {
                    let credential =
                        keychain
                            .resolve(&registry)
                            .ok_or_else(|| StoreError::AuthFailed {
                                registry: registry.clone(),
                                reason: "registry requires basic credentials".to_string(),
                            })?;
                    AuthScheme::Basic(credential)
                }
                Some(Challenge::Bearer { realm, service }) => {
                    let token =
                        fetch_token(client, &realm, service.as_deref(), reference, keychain)
                            .await?;
                    debug!(registry = %registry, "acquired pull-scope bearer token");
                    AuthScheme::Bearer(token)
                }
                None => {
                    return Err(StoreError::AuthFailed {
                        registry,
                        reason: format!("unsupported challenge {challenge:?}"),
                    });
                }
            }
        } else {
            return Err(StoreError::AuthFailed {
                registry,
                reason: format!("unexpected status {status} from {ping_url:?}"),
            });
        };

        Ok(Self {
            client: client.clone(),
            registry,
            scheme,
        })
    }

    /// Build a request, attaching authorization when `url` targets the
    /// registry this transport was negotiated for.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        if url_authority(url).as_deref() != Some(self.registry.as_str()) {
            return builder;
        }
        match &self.scheme {
            AuthScheme::None => builder,
            AuthScheme::Basic(credential) => {
                builder.basic_auth(&credential.username, Some(&credential.password))
            }
            AuthScheme::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

fn url_authority(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

/// Parse a `WWW-Authenticate` header value into a challenge.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = match header.split_once(char::is_whitespace) {
        Some((scheme, params)) => (scheme, params.trim()),
        None => (header, ""),
    };

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    for pair in params.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }

    realm.map(|realm| Challenge::Bearer { realm, service })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

async fn fetch_token(
    client: &Client,
    realm: &str,
    service: Option<&str>,
    reference: &Reference,
    keychain: &dyn Keychain,
) -> Result<String> {
    let registry = reference.domain().to_string();
    let scope = format!("repository:{}:pull", reference.path());

    let mut builder = client.get(realm).query(&[("scope", scope.as_str())]);
    if let Some(service) = service {
        builder = builder.query(&[("service", service)]);
    }
    if let Some(credential) = keychain.resolve(&registry) {
        builder = builder.basic_auth(&credential.username, Some(&credential.password));
    }

    let response = builder.send().await?;
    if !response.status().is_success() {
        return Err(StoreError::AuthFailed {
            registry,
            reason: format!(
                "token endpoint {realm:?} returned {}",
                response.status()
            ),
        });
    }

    let token: TokenResponse = response.json().await?;
    let token = if token.token.is_empty() {
        token.access_token
    } else {
        token.token
    };
    if token.is_empty() {
        return Err(StoreError::AuthFailed {
            registry,
            reason: format!("token endpoint {realm:?} returned an empty token"),
        });
    }
    Ok(token)
}
