//! Fetching artifacts from upstream registries.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode, Uri};
use tokio_util::io::StreamReader;

use crate::cache::Fetched;
use crate::client::{CollectError, UpstreamClient};
use crate::config::AuthConfig;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::{self, Accept};
use crate::resolve::{Reference, UpstreamRegistry};
use crate::token::{BearerChallenge, Scope, TokenBroker, TokenCacheEntry};

/// Largest manifest accepted from an upstream.
pub const MANIFEST_LIMIT: usize = 4 * 1024 * 1024;

/// Redirects followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// What to fetch from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A manifest by tag or digest, in one of the accepted media types.
    Manifest(Reference, Accept),
    /// A blob by digest.
    Blob(Digest),
}

impl Target {
    fn path(&self, repository: &str) -> String {
        match self {
            Target::Manifest(reference, _) => format!("/v2/{repository}/manifests/{reference}"),
            Target::Blob(digest) => format!("/v2/{repository}/blobs/{digest}"),
        }
    }

    fn not_found(&self, repository: &str) -> RegistryError {
        match self {
            Target::Manifest(reference, _) => {
                RegistryError::ManifestNotFound(format!("{repository}:{reference}"))
            }
            Target::Blob(digest) => RegistryError::BlobNotFound(format!("{repository}@{digest}")),
        }
    }
}

/// Issues requests to upstream registries, authenticating as needed.
///
/// Upstreams without a configured token endpoint are first tried
/// anonymously. When one answers with a bearer challenge, the challenge is
/// remembered and used up front for later requests to the same upstream.
#[derive(Debug, Clone)]
pub struct UpstreamFetcher {
    client: UpstreamClient,
    broker: TokenBroker,
    challenges: Arc<DashMap<String, AuthConfig>>,
}

impl UpstreamFetcher {
    /// Create a fetcher.
    pub fn new(client: UpstreamClient, broker: TokenBroker) -> Self {
        Self {
            client,
            broker,
            challenges: Default::default(),
        }
    }

    /// Fetch `target` from `repository` on `upstream`.
    ///
    /// Manifests are read fully into memory. Blob bodies are streamed to the
    /// caller as they arrive, and fail once the upstream stops sending data.
    #[tracing::instrument(skip(self, upstream), fields(upstream = %upstream.id))]
    pub async fn fetch(
        &self,
        upstream: Arc<UpstreamRegistry>,
        repository: String,
        target: Target,
    ) -> Result<Fetched, RegistryError> {
        let uri = parse_uri(&upstream, &upstream.url(&target.path(&repository)))?;
        let scope = Scope::pull(repository.as_str()).to_string();

        let known = upstream
            .auth
            .clone()
            .or_else(|| self.challenges.get(&upstream.id).map(|auth| auth.value().clone()));
        let token = match &known {
            Some(auth) => Some(
                self.broker
                    .upstream_token(&upstream.id, &auth.realm, &auth.service, &scope)
                    .await?,
            ),
            None => None,
        };

        let mut response = self.send(&upstream, &uri, &target, token.as_ref()).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(token) = token {
                self.broker.forget(&token);
                return Err(unauthorized(&upstream, "upstream rejected the token"));
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(BearerChallenge::parse)
                .ok_or_else(|| unauthorized(&upstream, "no bearer challenge offered"))?;
            let auth = AuthConfig {
                realm: challenge.realm,
                service: challenge.service.unwrap_or_default(),
            };
            let scope = challenge.scope.unwrap_or(scope);
            tracing::debug!(realm = %auth.realm, service = %auth.service, "Upstream challenged");

            let token = self
                .broker
                .upstream_token(&upstream.id, &auth.realm, &auth.service, &scope)
                .await?;
            self.challenges.insert(upstream.id.clone(), auth);

            response = self.send(&upstream, &uri, &target, Some(&token)).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                self.broker.forget(&token);
                return Err(unauthorized(&upstream, "upstream rejected the token"));
            }
        }

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(target.not_found(&repository)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(unauthorized(&upstream, response.status().as_str()));
            }
            status => {
                return Err(RegistryError::UpstreamUnavailable {
                    upstream: upstream.id.clone(),
                    reason: format!("upstream answered {status}"),
                });
            }
        }

        let declared = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.into_body();

        match target {
            Target::Manifest(..) => {
                let data = self
                    .client
                    .collect_limited(body, MANIFEST_LIMIT)
                    .await
                    .map_err(|error| match error {
                        CollectError::TooLarge(limit) => RegistryError::InvalidManifest(
                            format!("{repository}: manifest exceeds {limit} bytes"),
                        ),
                        CollectError::TimedOut(_) => {
                            RegistryError::UpstreamTimeout(upstream.id.clone())
                        }
                        CollectError::Body(reason) => RegistryError::UpstreamUnavailable {
                            upstream: upstream.id.clone(),
                            reason,
                        },
                    })?;
                Ok(Fetched {
                    content_type: manifest::content_type(declared.as_deref(), &data),
                    body: Box::new(io::Cursor::new(data)),
                    upstream: upstream.id.clone(),
                })
            }
            Target::Blob(_) => {
                let stream = self.client.body_stream(body);
                Ok(Fetched {
                    body: Box::new(StreamReader::new(stream)),
                    content_type: manifest::BLOB.to_owned(),
                    upstream: upstream.id.clone(),
                })
            }
        }
    }

    /// Send one GET, following redirects. Credentials are only sent to the
    /// upstream's own host.
    async fn send(
        &self,
        upstream: &UpstreamRegistry,
        uri: &Uri,
        target: &Target,
        token: Option<&TokenCacheEntry>,
    ) -> Result<http::Response<hyperdriver::Body>, RegistryError> {
        let mut uri = uri.clone();
        for _ in 0..=MAX_REDIRECTS {
            let mut headers = HeaderMap::new();
            if let Target::Manifest(_, accept) = target {
                if let Some(value) = accept.header_value() {
                    headers.insert(ACCEPT, value);
                }
            }
            if let Some(token) = token.filter(|_| same_host(upstream, &uri)) {
                let value = token
                    .token
                    .bearer()
                    .map_err(|_| unauthorized(upstream, "token is not a valid header value"))?;
                headers.insert(AUTHORIZATION, value);
            }

            let response = self
                .client
                .get(uri.clone(), headers)
                .await
                .map_err(|error| match error {
                    hyperdriver::client::Error::RequestTimeout => {
                        RegistryError::UpstreamTimeout(upstream.id.clone())
                    }
                    error => RegistryError::UpstreamUnavailable {
                        upstream: upstream.id.clone(),
                        reason: error.to_string(),
                    },
                })?;

            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| RegistryError::UpstreamUnavailable {
                    upstream: upstream.id.clone(),
                    reason: format!("{} without a location", response.status()),
                })?;
            uri = redirect_target(upstream, &uri, location)?;
            tracing::trace!(%uri, "Following redirect");
        }

        Err(RegistryError::UpstreamUnavailable {
            upstream: upstream.id.clone(),
            reason: "too many redirects".into(),
        })
    }
}

fn unauthorized(upstream: &UpstreamRegistry, reason: impl Into<String>) -> RegistryError {
    RegistryError::UpstreamUnauthorized {
        upstream: upstream.id.clone(),
        reason: reason.into(),
    }
}

fn parse_uri(upstream: &UpstreamRegistry, value: &str) -> Result<Uri, RegistryError> {
    value
        .parse()
        .map_err(|error| RegistryError::UpstreamUnavailable {
            upstream: upstream.id.clone(),
            reason: format!("invalid url {value:?}: {error}"),
        })
}

fn same_host(upstream: &UpstreamRegistry, uri: &Uri) -> bool {
    uri.authority()
        .is_some_and(|authority| authority.as_str().eq_ignore_ascii_case(&upstream.host))
}

fn redirect_target(
    upstream: &UpstreamRegistry,
    current: &Uri,
    location: &str,
) -> Result<Uri, RegistryError> {
    let base = url::Url::parse(&current.to_string()).map_err(|error| {
        RegistryError::UpstreamUnavailable {
            upstream: upstream.id.clone(),
            reason: error.to_string(),
        }
    })?;
    let next = base
        .join(location)
        .map_err(|error| RegistryError::UpstreamUnavailable {
            upstream: upstream.id.clone(),
            reason: format!("bad redirect {location:?}: {error}"),
        })?;
    parse_uri(upstream, next.as_str())
}
