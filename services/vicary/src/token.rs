//! Bearer tokens: issuance to local clients, and relay to upstreams.
//!
//! The gateway plays two roles. Towards clients it is a token service: it
//! issues opaque tokens and remembers which repositories each one may pull.
//! Towards upstreams it is a client: it exchanges challenges for upstream
//! tokens and caches them per upstream, scope and service, with concurrent
//! exchanges for the same key coalesced into one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use echocache::{BoxFut, CacheMap, Fresh};
use http::header::{AUTHORIZATION, InvalidHeaderValue};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_auth::{ChallengeRef, parser::ChallengeParser};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::client::{CollectError, UpstreamClient};
use crate::error::RegistryError;
use crate::resolve::{ReferenceResolver, UpstreamRegistry};

/// Lifetime assumed for upstream tokens which do not state one.
const DEFAULT_UPSTREAM_LIFETIME: Duration = Duration::from_secs(60);

/// Upstream tokens are renewed this long before they expire.
const RENEWAL_MARGIN: Duration = Duration::from_secs(5);

/// Largest token response accepted from an upstream.
const TOKEN_BODY_LIMIT: usize = 64 * 1024;

/// A bearer token. The value is hidden from debug output and wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Generate a fresh opaque token of 64 hex characters.
    pub fn generate() -> Self {
        Token(format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Expose the token value.
    pub fn revealed(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for this token.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(****)")
    }
}

/// A token scope, e.g. `repository:library/python:pull`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Resource type, usually `repository`.
    pub resource_type: String,
    /// Resource name. May contain `:` when it carries a registry port.
    pub name: String,
    /// Requested actions.
    pub actions: Vec<String>,
}

impl Scope {
    /// Pull access to a repository.
    pub fn pull(repository: impl Into<String>) -> Self {
        Self {
            resource_type: "repository".into(),
            name: repository.into(),
            actions: vec!["pull".into()],
        }
    }
}

impl FromStr for Scope {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidReference(format!("invalid scope {s:?}"));
        let (resource_type, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (name, actions) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            resource_type: resource_type.into(),
            name: name.into(),
            actions: actions
                .split(',')
                .filter(|action| !action.is_empty())
                .map(String::from)
                .collect(),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.name,
            self.actions.join(",")
        )
    }
}

/// A `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name to request a token for.
    pub service: Option<String>,
    /// Scope the token must grant.
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// A challenge for `realm` and `service`.
    pub fn new(realm: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            service: Some(service.into()),
            scope: None,
        }
    }

    /// Add the scope the client should ask for.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Find the first bearer challenge in a `WWW-Authenticate` header.
    pub fn parse(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?;
        ChallengeParser::new(value)
            .filter_map(|challenge| challenge.ok())
            .find_map(|challenge| Self::from_challenge(&challenge))
    }

    fn from_challenge(value: &ChallengeRef<'_>) -> Option<Self> {
        if !value.scheme.eq_ignore_ascii_case("Bearer") {
            return None;
        }
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (k, v) in &value.params {
            if k.eq_ignore_ascii_case("realm") {
                realm = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("service") {
                service = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("scope") {
                scope = Some(v.to_unescaped());
            }
        }
        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    /// Render as a `WWW-Authenticate` header value.
    pub fn to_header_value(&self) -> Option<HeaderValue> {
        let mut value = format!("Bearer realm=\"{}\"", quote(&self.realm));
        if let Some(service) = &self.service {
            value.push_str(&format!(",service=\"{}\"", quote(service)));
        }
        if let Some(scope) = &self.scope {
            value.push_str(&format!(",scope=\"{}\"", quote(scope)));
        }
        HeaderValue::from_str(&value).ok()
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Body of a token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The token.
    pub token: String,
    /// The same token, under its OAuth2 name.
    pub access_token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
    /// RFC 3339 issue time.
    pub issued_at: String,
}

/// What upstream token endpoints actually send: any field may be missing.
#[derive(Debug, Deserialize)]
struct UpstreamTokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

/// A token obtained from an upstream.
#[derive(Debug, Clone)]
pub struct TokenCacheEntry {
    /// Id of the upstream the token is for.
    pub upstream: String,
    /// Scope the token was requested for.
    pub scope: String,
    /// Service the token was requested for.
    pub service: String,
    /// Bearer token.
    pub token: Token,
    /// OAuth2 access token; equal to `token` when the upstream sends only one.
    pub access_token: Token,
    /// When the upstream issued the token.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Grant {
    upstream: String,
    repository: String,
    actions: Vec<String>,
}

impl Grant {
    fn allows(&self, upstream: &str, repository: &str) -> bool {
        self.upstream == upstream
            && self.repository == repository
            && self
                .actions
                .iter()
                .any(|action| action == "pull" || action == "*")
    }
}

#[derive(Debug)]
struct IssuedToken {
    grants: Vec<Grant>,
    expires_at: DateTime<Utc>,
}

/// Upstream tokens are never shared between upstreams, even when two of them
/// name the same service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    upstream: String,
    scope: String,
    service: String,
}

impl TokenKey {
    fn new(upstream: &str, scope: &str, service: &str) -> Self {
        Self {
            upstream: upstream.to_owned(),
            scope: scope.to_owned(),
            service: service.to_owned(),
        }
    }
}

type UpstreamTokens = CacheMap<TokenKey, TokenCacheEntry, RegistryError>;

/// Issues tokens to clients and obtains tokens from upstreams.
#[derive(Debug, Clone)]
pub struct TokenBroker {
    issued: Arc<DashMap<String, IssuedToken>>,
    upstream: UpstreamTokens,
    client: UpstreamClient,
    lifetime: Duration,
}

impl TokenBroker {
    /// Create a broker issuing tokens valid for `lifetime`.
    pub fn new(client: UpstreamClient, lifetime: Duration) -> Self {
        Self {
            issued: Default::default(),
            upstream: CacheMap::new(),
            client,
            lifetime,
        }
    }

    /// Issue a token for the requested scopes.
    ///
    /// Every `repository` scope is resolved to its canonical upstream and name;
    /// other resource types are ignored. A request without scopes yields a
    /// token which only passes the `/v2/` check.
    #[tracing::instrument(skip(self, resolver))]
    pub fn issue(
        &self,
        resolver: &ReferenceResolver,
        scopes: &[String],
    ) -> Result<TokenResponse, RegistryError> {
        let mut grants = Vec::new();
        for scope in scopes {
            let scope: Scope = scope.parse()?;
            if scope.resource_type != "repository" {
                tracing::debug!(%scope, "Ignoring scope for unsupported resource type");
                continue;
            }
            let resolution = resolver.resolve(&scope.name)?;
            grants.push(Grant {
                upstream: resolution.upstream.id.clone(),
                repository: resolution.repository,
                actions: scope.actions,
            });
        }

        let now = Utc::now();
        self.issued.retain(|_, issued| issued.expires_at > now);

        let token = Token::generate();
        self.issued.insert(
            token.revealed().to_owned(),
            IssuedToken {
                grants,
                expires_at: after(now, self.lifetime),
            },
        );
        tracing::debug!(tokens = self.issued.len(), "Issued token");

        Ok(TokenResponse {
            token: token.revealed().to_owned(),
            access_token: token.revealed().to_owned(),
            expires_in: self.lifetime.as_secs(),
            issued_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn lookup<R>(&self, headers: &HeaderMap, f: impl FnOnce(&IssuedToken) -> R) -> Option<R> {
        let token = bearer_token(headers)?;
        let issued = self.issued.get(token)?;
        (issued.expires_at > Utc::now()).then(|| f(issued.value()))
    }

    /// True when the request carries any unexpired token issued here.
    pub fn is_valid(&self, headers: &HeaderMap) -> bool {
        self.lookup(headers, |_| ()).is_some()
    }

    /// True when the request's token grants pull access to `repository`.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        upstream: &UpstreamRegistry,
        repository: &str,
    ) -> bool {
        self.lookup(headers, |issued| {
            issued
                .grants
                .iter()
                .any(|grant| grant.allows(&upstream.id, repository))
        })
        .unwrap_or(false)
    }

    /// Get a token for `scope` at an upstream token endpoint, reusing a cached
    /// one until shortly before it expires.
    #[tracing::instrument(skip(self))]
    pub async fn upstream_token(
        &self,
        upstream: &str,
        realm: &str,
        service: &str,
        scope: &str,
    ) -> Result<TokenCacheEntry, RegistryError> {
        let key = TokenKey::new(upstream, scope, service);
        let exchange = Exchange {
            client: self.client.clone(),
            upstream: upstream.to_owned(),
            realm: realm.to_owned(),
            service: service.to_owned(),
            scope: scope.to_owned(),
        };
        self.upstream
            .get_or_fetch(
                key,
                move || -> BoxFut<'static, Result<Fresh<TokenCacheEntry>, RegistryError>> {
                    Box::pin(exchange.run())
                },
            )
            .await
    }

    /// Drop a cached upstream token which the upstream no longer accepts.
    pub fn forget(&self, token: &TokenCacheEntry) {
        let key = TokenKey::new(&token.upstream, &token.scope, &token.service);
        if self.upstream.invalidate(&key) {
            tracing::debug!(
                upstream = %token.upstream,
                service = %token.service,
                scope = %token.scope,
                "Forgot rejected upstream token"
            );
        }
    }
}

fn after(start: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| start.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Extract the token from an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("Bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

#[derive(Debug)]
struct Exchange {
    client: UpstreamClient,
    upstream: String,
    realm: String,
    service: String,
    scope: String,
}

impl Exchange {
    fn unauthorized(&self, reason: impl Into<String>) -> RegistryError {
        RegistryError::UpstreamUnauthorized {
            upstream: self.upstream.clone(),
            reason: reason.into(),
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> RegistryError {
        RegistryError::UpstreamUnavailable {
            upstream: self.upstream.clone(),
            reason: format!("token exchange with {}: {reason}", self.realm),
        }
    }

    fn uri(&self) -> Result<http::Uri, RegistryError> {
        let mut url = url::Url::parse(&self.realm)
            .map_err(|err| self.unauthorized(format!("invalid realm {:?}: {err}", self.realm)))?;
        if !self.service.is_empty() || !self.scope.is_empty() {
            let mut query = url.query_pairs_mut();
            if !self.service.is_empty() {
                query.append_pair("service", &self.service);
            }
            if !self.scope.is_empty() {
                query.append_pair("scope", &self.scope);
            }
        }
        url.as_str()
            .parse()
            .map_err(|err| self.unauthorized(format!("invalid realm {:?}: {err}", self.realm)))
    }

    async fn run(self) -> Result<Fresh<TokenCacheEntry>, RegistryError> {
        let uri = self.uri()?;
        tracing::debug!(realm = %self.realm, scope = %self.scope, "Requesting upstream token");

        let response = self
            .client
            .get(uri, HeaderMap::new())
            .await
            .map_err(|err| match err {
                hyperdriver::client::Error::RequestTimeout => {
                    RegistryError::UpstreamTimeout(self.upstream.clone())
                }
                err => self.unavailable(err),
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(self.unavailable(status));
        }
        if !status.is_success() {
            let reason = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                format!("token request rejected with {status}")
            } else {
                format!("token request failed with {status}")
            };
            return Err(self.unauthorized(reason));
        }

        let body = self
            .client
            .collect_limited(response.into_body(), TOKEN_BODY_LIMIT)
            .await
            .map_err(|err| match err {
                CollectError::TimedOut(_) => RegistryError::UpstreamTimeout(self.upstream.clone()),
                err => self.unavailable(err),
            })?;
        let body: UpstreamTokenResponse = serde_json::from_slice(&body)
            .map_err(|err| self.unauthorized(format!("malformed token response: {err}")))?;

        let token = body
            .token
            .clone()
            .or_else(|| body.access_token.clone())
            .ok_or_else(|| self.unauthorized("token response carries no token"))?;
        let access_token = body.access_token.unwrap_or_else(|| token.clone());

        let issued_at = body
            .issued_at
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let lifetime = body
            .expires_in
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UPSTREAM_LIFETIME);
        let expires_at = after(issued_at, lifetime);

        let usable = (expires_at - Utc::now())
            .to_std()
            .unwrap_or_default()
            .saturating_sub(RENEWAL_MARGIN);

        let entry = TokenCacheEntry {
            upstream: self.upstream.clone(),
            scope: self.scope.clone(),
            service: self.service.clone(),
            token: token.into(),
            access_token: access_token.into(),
            issued_at,
            expires_at,
        };
        Ok(Fresh::until(entry, Instant::now() + usable))
    }
}
