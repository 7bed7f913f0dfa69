//! Registry protocol handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use storage::{StorageError, StorageErrorKind};
use tokio_util::io::ReaderStream;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::Config;
use crate::error::{RegistryError, RegistryResult, docker_content_digest};
use crate::manifest::Accept;
use crate::resolve::{Reference, ReferenceResolver, RegistryReference, UpstreamRegistry};
use crate::token::{BearerChallenge, Scope, TokenBroker, TokenResponse};
use crate::upstream::{Target, UpstreamFetcher};

/// Service name in challenges when the default upstream has none.
const DEFAULT_SERVICE: &str = "vicary";

/// Shared state of the gateway handlers.
#[derive(Debug, Clone)]
pub struct Gateway {
    resolver: Arc<ReferenceResolver>,
    broker: TokenBroker,
    store: CacheStore,
    fetcher: UpstreamFetcher,
    accept: Accept,
    scheme: String,
    public_url: Option<String>,
}

impl Gateway {
    /// Assemble the gateway from its parts.
    pub fn new(
        config: &Config,
        resolver: ReferenceResolver,
        broker: TokenBroker,
        store: CacheStore,
        fetcher: UpstreamFetcher,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            broker,
            store,
            fetcher,
            accept: config.fallback_accept(),
            scheme: config.scheme.clone(),
            public_url: config
                .public_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_owned()),
        }
    }

    /// The token endpoint clients are sent to.
    fn realm(&self, headers: &HeaderMap) -> String {
        match &self.public_url {
            Some(base) => format!("{base}/token"),
            None => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("localhost");
                format!("{}://{host}/token", self.scheme)
            }
        }
    }

    /// Check the client's token against the repository, for upstreams which
    /// require authentication.
    fn authorize(
        &self,
        headers: &HeaderMap,
        upstream: &UpstreamRegistry,
        repository: &str,
    ) -> RegistryResult<()> {
        let Some(auth) = &upstream.auth else {
            return Ok(());
        };
        if self.broker.authorize(headers, upstream, repository) {
            return Ok(());
        }

        let name = self.resolver.scope_name(upstream, repository);
        tracing::debug!(repository = %name, "Rejecting request without a usable token");
        Err(RegistryError::Unauthorized(
            BearerChallenge::new(self.realm(headers), auth.service.clone())
                .with_scope(Scope::pull(name).to_string()),
        ))
    }

    /// Serve a cached artifact, fetching it on a miss.
    ///
    /// GET and HEAD both confirm the stored bytes are still present.
    async fn serve(
        &self,
        method: &Method,
        key: CacheKey,
        upstream: Arc<UpstreamRegistry>,
        repository: String,
        target: Target,
    ) -> RegistryResult<Response> {
        let mut retried = false;
        loop {
            let fetcher = self.fetcher.clone();
            let upstream = upstream.clone();
            let repository = repository.clone();
            let fetch_target = target.clone();
            let entry = self
                .store
                .get_or_fetch(key.clone(), move || async move {
                    fetcher.fetch(upstream, repository, fetch_target).await
                })
                .await?;

            let body = if *method == Method::HEAD {
                self.store.contains(&entry).await?.then(Body::empty)
            } else {
                self.store
                    .open(&entry)
                    .await?
                    .map(|stream| Body::from_stream(ReaderStream::new(stream)))
            };

            match body {
                Some(body) => return Ok(respond(&entry, body)),
                None if !retried => {
                    tracing::warn!(%key, "Stored bytes are missing, fetching again");
                    self.store.invalidate(&key).await?;
                    retried = true;
                }
                None => {
                    return Err(StorageError::new(
                        "cache",
                        StorageErrorKind::NotFound,
                        format!("bytes for {key} vanished after a refetch"),
                    )
                    .into());
                }
            }
        }
    }
}

/// Routes for the registry protocol, the token endpoint and health checks.
pub(crate) fn router() -> Router<Gateway> {
    Router::new()
        .route("/health", get(health))
        .route("/health/", get(health))
        .route("/token", get(token))
        .route("/token/", get(token))
        .route("/v2/", get(version_check))
        .route("/v2/{*path}", get(artifact))
        .fallback(not_found)
}

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Issue a token for the `scope` parameters, which may repeat.
async fn token(
    State(gateway): State<Gateway>,
    RawQuery(query): RawQuery,
) -> RegistryResult<Json<TokenResponse>> {
    let scopes: Vec<String> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .filter(|(key, _)| key == "scope")
        .flat_map(|(_, value)| {
            value
                .split(' ')
                .filter(|scope| !scope.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect();

    let response = gateway.broker.issue(&gateway.resolver, &scopes)?;
    Ok(Json(response))
}

/// API version check. Answers 401 with a challenge until the client presents
/// a token issued here.
async fn version_check(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
) -> RegistryResult<Json<serde_json::Value>> {
    if gateway.broker.is_valid(&headers) {
        return Ok(Json(json!({})));
    }

    let service = gateway
        .resolver
        .default_upstream()
        .auth
        .as_ref()
        .map(|auth| auth.service.clone())
        .unwrap_or_else(|| DEFAULT_SERVICE.to_owned());
    Err(RegistryError::Unauthorized(BearerChallenge::new(
        gateway.realm(&headers),
        service,
    )))
}

/// Manifest and blob retrieval: `/v2/<name>/(manifests|blobs)/<reference>`.
async fn artifact(
    State(gateway): State<Gateway>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let mut parts = path.rsplitn(3, '/');
    let (Some(reference), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    if kind != "manifests" && kind != "blobs" {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let (upstream, parsed) = gateway.resolver.resolve_reference(name, reference)?;
    tracing::trace!(
        upstream = %upstream.id,
        host = ?parsed.explicit_host,
        repository = %parsed.repository,
        reference = %parsed.reference,
        "Resolved"
    );
    let RegistryReference {
        repository,
        reference,
        ..
    } = parsed;

    let target = match reference {
        reference if kind == "manifests" => {
            Target::Manifest(reference, Accept::from_headers(&headers, &gateway.accept))
        }
        Reference::Digest(digest) => Target::Blob(digest),
        Reference::Tag(tag) => return Err(RegistryError::InvalidDigest(tag)),
    };
    gateway.authorize(&headers, &upstream, &repository)?;

    let key = match &target {
        Target::Manifest(reference, accept) => {
            let key = CacheKey::manifest(
                upstream.id.as_str(),
                repository.as_str(),
                reference.clone(),
                accept,
            );
            if matches!(reference, Reference::Tag(_)) && wants_refresh(&headers) {
                tracing::debug!(%key, "Client asked for a fresh manifest");
                gateway.store.invalidate(&key).await?;
            }
            key
        }
        Target::Blob(digest) => CacheKey::Blob(digest.clone()),
    };

    gateway
        .serve(&method, key, upstream, repository, target)
        .await
}

fn wants_refresh(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
}

fn respond(entry: &CacheEntry, body: Body) -> Response {
    let content_type = HeaderValue::from_str(&entry.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(crate::manifest::BLOB));
    let (digest_header, digest) = docker_content_digest(&entry.digest);

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size));
    headers.insert(digest_header, digest);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cache_is_found_among_directives() {
        let mut headers = HeaderMap::new();
        assert!(!wants_refresh(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        assert!(!wants_refresh(&headers));

        headers.append(
            header::CACHE_CONTROL,
            HeaderValue::from_static("private, No-Cache"),
        );
        assert!(wants_refresh(&headers));
    }
}
