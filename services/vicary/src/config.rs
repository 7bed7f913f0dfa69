//! Gateway configuration.
//!
//! Configuration is loaded once at startup from an optional TOML file and
//! command-line / environment overrides, and is immutable afterwards.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::StorageConfig;

use crate::manifest::{self, Accept};

/// Errors found while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// Path of the configuration file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("parsing configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// `default-upstream` names no configured upstream.
    #[error("default upstream {0:?} is not configured")]
    UnknownDefaultUpstream(String),

    /// Two upstreams claim the same host identifier.
    #[error("host identifier {0:?} is claimed by more than one upstream")]
    DuplicateIdentifier(String),

    /// An upstream entry is unusable.
    #[error("upstream {id:?}: {reason}")]
    InvalidUpstream {
        /// Upstream id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The URL scheme is neither `http` nor `https`.
    #[error("unsupported scheme {0:?}")]
    InvalidScheme(String),
}

/// Static bearer-token configuration for an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    /// Token endpoint of the upstream.
    pub realm: String,
    /// Service name sent to the token endpoint.
    pub service: String,
}

/// One upstream registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    /// Stable identifier, also usable as a path prefix.
    pub id: String,
    /// Network host (and optional port) of the registry API.
    pub host: String,
    /// Additional path prefixes which select this upstream.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// `https` unless stated otherwise.
    #[serde(default = "default_upstream_scheme")]
    pub scheme: String,
    /// When set, clients must present a gateway token and requests to the
    /// upstream are authenticated against this realm.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Namespace prepended to single-segment repository names.
    #[serde(default)]
    pub official_prefix: Option<String>,
}

fn default_upstream_scheme() -> String {
    "https".into()
}

impl UpstreamConfig {
    /// An upstream reached over https with no static authentication.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            aliases: Vec::new(),
            scheme: default_upstream_scheme(),
            auth: None,
            official_prefix: None,
        }
    }

    fn docker_hub() -> Self {
        Self {
            aliases: vec![
                "docker.io".into(),
                "index.docker.io".into(),
                "registry-1.docker.io".into(),
            ],
            auth: Some(AuthConfig {
                realm: "https://auth.docker.io/token".into(),
                service: "registry.docker.io".into(),
            }),
            official_prefix: Some("library".into()),
            ..Self::new("docker.io", "registry-1.docker.io")
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Scheme clients use to reach the gateway, used to build token realms.
    pub scheme: String,
    /// Externally visible base URL, when it differs from the request `Host`.
    pub public_url: Option<String>,
    /// Id of the upstream used for paths without a host prefix.
    pub default_upstream: String,
    /// Upstream registries.
    pub upstreams: Vec<UpstreamConfig>,
    /// Seconds a tag-addressed manifest is served before revalidating. `0` keeps
    /// manifests until they are invalidated.
    pub manifest_ttl: u64,
    /// Seconds a locally issued token stays valid.
    pub token_lifetime: u64,
    /// Seconds allowed for one upstream request before it is abandoned.
    pub upstream_timeout: u64,
    /// `Accept` values sent with manifest requests when the client sends
    /// none of its own.
    pub manifest_accept: Vec<String>,
    /// Where artifacts are stored.
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            public_url: None,
            default_upstream: "docker.io".into(),
            upstreams: vec![
                UpstreamConfig::docker_hub(),
                UpstreamConfig::new("quay.io", "quay.io"),
                UpstreamConfig::new("gcr.io", "gcr.io"),
                UpstreamConfig::new("ghcr.io", "ghcr.io"),
            ],
            manifest_ttl: 300,
            token_lifetime: 300,
            upstream_timeout: 30,
            manifest_accept: manifest::LEGACY
                .iter()
                .map(|media_type| media_type.to_string())
                .collect(),
            storage: StorageConfig::Memory,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Check the settings which cannot be expressed in the schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme(&self.scheme)?;
        for upstream in &self.upstreams {
            check_scheme(&upstream.scheme).map_err(|_| ConfigError::InvalidUpstream {
                id: upstream.id.clone(),
                reason: format!("unsupported scheme {:?}", upstream.scheme),
            })?;
            if upstream.host.is_empty() || upstream.host.contains('/') {
                return Err(ConfigError::InvalidUpstream {
                    id: upstream.id.clone(),
                    reason: format!("invalid host {:?}", upstream.host),
                });
            }
        }
        if !self
            .upstreams
            .iter()
            .any(|upstream| upstream.id == self.default_upstream)
        {
            return Err(ConfigError::UnknownDefaultUpstream(
                self.default_upstream.clone(),
            ));
        }
        Ok(())
    }

    /// Manifest types requested for clients which do not name any.
    pub fn fallback_accept(&self) -> Accept {
        Accept::new(&self.manifest_accept)
    }

    /// Lifetime of tag-addressed manifests, `None` when they never expire.
    pub fn manifest_ttl(&self) -> Option<Duration> {
        (self.manifest_ttl > 0).then(|| Duration::from_secs(self.manifest_ttl))
    }

    /// Lifetime of locally issued tokens.
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime.max(1))
    }

    /// Timeout for a single upstream request.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout.max(1))
    }
}

fn check_scheme(scheme: &str) -> Result<(), ConfigError> {
    match scheme {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidScheme(other.into())),
    }
}
