//! Repository references and upstream selection.
//!
//! A client addresses a repository either by its bare name, which is served
//! from the default upstream, or prefixed with a host identifier naming
//! another upstream: `library/python` and `docker.io/library/python` are the
//! same repository, `quay.io/coreos/etcd` lives on quay.io.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{AuthConfig, Config, ConfigError};
use crate::digest::Digest;
use crate::error::RegistryError;

/// Longest accepted repository name.
const MAX_NAME_LENGTH: usize = 255;

/// Longest accepted tag.
const MAX_TAG_LENGTH: usize = 128;

/// A configured upstream registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRegistry {
    /// Stable identifier, shared by every spelling of this upstream.
    pub id: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Host (and optional port) of the registry API.
    pub host: String,
    /// Lowercase path prefixes which select this upstream.
    pub identifiers: Vec<String>,
    /// Static token endpoint, when the upstream requires authentication.
    pub auth: Option<AuthConfig>,
    /// Namespace for single-segment names.
    pub official_prefix: Option<String>,
}

impl UpstreamRegistry {
    /// URL of a path on this upstream.
    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

/// A tag or digest naming one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// The digest, for digest references.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            return s.parse().map(Reference::Digest);
        }
        if is_tag(s) {
            Ok(Reference::Tag(s.to_string()))
        } else {
            Err(RegistryError::InvalidReference(format!("invalid tag {s:?}")))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn is_tag(s: &str) -> bool {
    let mut bytes = s.bytes();
    let first_ok = matches!(bytes.next(), Some(b) if b.is_ascii_alphanumeric() || b == b'_');
    first_ok
        && s.len() <= MAX_TAG_LENGTH
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_name_component(s: &str) -> bool {
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !bytes.first().copied().is_some_and(alnum) || !bytes.last().copied().is_some_and(alnum) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        match &bytes[start..i] {
            b"." | b"_" | b"__" => {}
            run if run.iter().all(|b| *b == b'-') => {}
            _ => return false,
        }
    }
    true
}

/// The outcome of resolving a repository path.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Upstream serving the repository.
    pub upstream: Arc<UpstreamRegistry>,
    /// The host prefix the client wrote, if any.
    pub explicit_host: Option<String>,
    /// Canonical repository name on the upstream.
    pub repository: String,
}

/// A fully parsed client reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryReference {
    /// The host prefix the client wrote, if any.
    pub explicit_host: Option<String>,
    /// Canonical repository name on the upstream.
    pub repository: String,
    /// Tag or digest.
    pub reference: Reference,
}

/// Maps client repository paths to upstream registries.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    upstreams: Vec<Arc<UpstreamRegistry>>,
    identifiers: HashMap<String, usize>,
    default: usize,
}

impl ReferenceResolver {
    /// Build the identifier table from configuration.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut upstreams = Vec::with_capacity(config.upstreams.len());
        let mut identifiers = HashMap::new();
        for (index, upstream) in config.upstreams.iter().enumerate() {
            let mut names: Vec<String> = std::iter::once(&upstream.id)
                .chain(std::iter::once(&upstream.host))
                .chain(upstream.aliases.iter())
                .map(|name| name.trim_matches('/').to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect();
            names.sort();
            names.dedup();

            for name in &names {
                if identifiers.insert(name.clone(), index).is_some() {
                    return Err(ConfigError::DuplicateIdentifier(name.clone()));
                }
            }

            upstreams.push(Arc::new(UpstreamRegistry {
                id: upstream.id.clone(),
                scheme: upstream.scheme.clone(),
                host: upstream.host.clone(),
                identifiers: names,
                auth: upstream.auth.clone(),
                official_prefix: upstream.official_prefix.clone(),
            }));
        }

        let default = config
            .upstreams
            .iter()
            .position(|upstream| upstream.id == config.default_upstream)
            .ok_or_else(|| ConfigError::UnknownDefaultUpstream(config.default_upstream.clone()))?;

        Ok(Self {
            upstreams,
            identifiers,
            default,
        })
    }

    /// The upstream serving unprefixed names.
    pub fn default_upstream(&self) -> &Arc<UpstreamRegistry> {
        &self.upstreams[self.default]
    }

    /// Resolve a repository path to its upstream and canonical name.
    ///
    /// The longest run of leading segments matching a host identifier selects
    /// the upstream; at least one segment must remain for the repository.
    /// Paths without a matching prefix go to the default upstream.
    pub fn resolve(&self, raw: &str) -> Result<Resolution, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidReference(format!("{raw:?}: {reason}"));

        if raw.is_empty() {
            return Err(invalid("empty repository name"));
        }
        let segments: Vec<&str> = raw.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        let matched = (1..segments.len()).rev().find_map(|split| {
            let prefix = segments[..split].join("/").to_ascii_lowercase();
            self.identifiers
                .get(&prefix)
                .map(|index| (*index, split, segments[..split].join("/")))
        });

        let (index, rest, explicit_host) = match matched {
            Some((index, split, host)) => (index, &segments[split..], Some(host)),
            None => (self.default, &segments[..], None),
        };
        let upstream = &self.upstreams[index];

        if let Some(segment) = rest.iter().find(|segment| !is_name_component(segment)) {
            return Err(invalid(&format!("invalid path component {segment:?}")));
        }

        let repository = match (&upstream.official_prefix, rest) {
            (Some(prefix), [name]) => format!("{prefix}/{name}"),
            _ => rest.join("/"),
        };
        if repository.len() > MAX_NAME_LENGTH {
            return Err(invalid("repository name too long"));
        }

        Ok(Resolution {
            upstream: upstream.clone(),
            explicit_host,
            repository,
        })
    }

    /// Resolve a repository path and parse the reference within it.
    pub fn resolve_reference(
        &self,
        raw: &str,
        reference: &str,
    ) -> Result<(Arc<UpstreamRegistry>, RegistryReference), RegistryError> {
        let resolution = self.resolve(raw)?;
        let reference = reference.parse()?;
        Ok((
            resolution.upstream,
            RegistryReference {
                explicit_host: resolution.explicit_host,
                repository: resolution.repository,
                reference,
            },
        ))
    }

    /// The repository name clients use in token scopes: the bare name on the
    /// default upstream, prefixed by the upstream id elsewhere.
    pub fn scope_name(&self, upstream: &UpstreamRegistry, repository: &str) -> String {
        if upstream.id == self.default_upstream().id {
            repository.to_string()
        } else {
            format!("{}/{}", upstream.id, repository)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn resolver() -> ReferenceResolver {
        ReferenceResolver::new(&Config::default()).unwrap()
    }

    #[test]
    fn bare_and_prefixed_names_are_equivalent() {
        let resolver = resolver();
        let bare = resolver.resolve("library/python").unwrap();
        let prefixed = resolver.resolve("docker.io/library/python").unwrap();

        assert_eq!(bare.upstream.id, "docker.io");
        assert_eq!(prefixed.upstream.id, "docker.io");
        assert_eq!(bare.repository, "library/python");
        assert_eq!(prefixed.repository, "library/python");
        assert_eq!(bare.explicit_host, None);
        assert_eq!(prefixed.explicit_host.as_deref(), Some("docker.io"));
    }

    #[test]
    fn official_images_get_library_prefix() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("python").unwrap().repository, "library/python");
        assert_eq!(
            resolver.resolve("index.docker.io/python").unwrap().repository,
            "library/python"
        );
        assert_eq!(
            resolver.resolve("quay.io/etcd").unwrap().repository,
            "etcd"
        );
    }

    #[test]
    fn alternate_upstreams_are_selected_by_prefix() {
        let resolver = resolver();
        let quay = resolver.resolve("quay.io/coreos/etcd").unwrap();
        assert_eq!(quay.upstream.id, "quay.io");
        assert_eq!(quay.repository, "coreos/etcd");

        let host_case = resolver.resolve("GHCR.IO/owner/tool").unwrap();
        assert_eq!(host_case.upstream.id, "ghcr.io");
        assert_eq!(host_case.repository, "owner/tool");
    }

    #[test]
    fn host_alone_is_a_repository_on_the_default_upstream() {
        let resolver = resolver();
        let host_only = resolver.resolve("quay.io").unwrap();
        assert_eq!(host_only.upstream.id, "docker.io");
        assert_eq!(host_only.repository, "library/quay.io");
        assert_eq!(host_only.explicit_host, None);

        let unknown = resolver.resolve("example/app").unwrap();
        assert_eq!(unknown.upstream.id, "docker.io");
        assert_eq!(unknown.repository, "example/app");
    }

    #[test]
    fn longest_identifier_wins() {
        let mut config = Config::default();
        config.upstreams.push(UpstreamConfig {
            aliases: vec!["quay.io/mirror".into()],
            ..UpstreamConfig::new("mirror", "mirror.internal")
        });
        let resolver = ReferenceResolver::new(&config).unwrap();

        let mirrored = resolver.resolve("quay.io/mirror/app").unwrap();
        assert_eq!(mirrored.upstream.id, "mirror");
        assert_eq!(mirrored.repository, "app");

        let direct = resolver.resolve("quay.io/other/app").unwrap();
        assert_eq!(direct.upstream.id, "quay.io");
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let resolver = resolver();
        for raw in [
            "",
            "/library/python",
            "library/python/",
            "library//python",
            "library/../etc",
            "library/./python",
            "Library/Python",
            "library/py thon",
            "library/-python",
            "library/python.",
            "library/py...thon",
        ] {
            assert!(
                matches!(resolver.resolve(raw), Err(RegistryError::InvalidReference(_))),
                "{raw:?} should be rejected"
            );
        }

        assert!(resolver.resolve("library/python__3").is_ok());
        assert!(resolver.resolve("library/my--app").is_ok());
    }

    #[test]
    fn references_resolve_with_their_repository() {
        let resolver = resolver();
        let (upstream, parsed) = resolver
            .resolve_reference("quay.io/jitesoft/debian", "10")
            .unwrap();
        assert_eq!(upstream.id, "quay.io");
        assert_eq!(
            parsed,
            RegistryReference {
                explicit_host: Some("quay.io".into()),
                repository: "jitesoft/debian".into(),
                reference: Reference::Tag("10".into()),
            }
        );

        assert!(matches!(
            resolver.resolve_reference("library/python", "sha256:nope"),
            Err(RegistryError::InvalidDigest(_))
        ));
        assert!(matches!(
            resolver.resolve_reference("library/python", "-bad"),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn duplicate_identifiers_are_a_config_error() {
        let mut config = Config::default();
        config.upstreams.push(UpstreamConfig {
            aliases: vec!["Docker.io".into()],
            ..UpstreamConfig::new("other", "other.example")
        });
        assert!(matches!(
            ReferenceResolver::new(&config),
            Err(ConfigError::DuplicateIdentifier(ref id)) if id == "docker.io"
        ));
    }

    #[test]
    fn references() {
        assert_eq!(
            "3.10".parse::<Reference>().unwrap(),
            Reference::Tag("3.10".into())
        );
        let digest = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert!(matches!(
            digest.parse::<Reference>().unwrap(),
            Reference::Digest(_)
        ));
        assert!(".hidden".parse::<Reference>().is_err());
        assert!("a".repeat(129).parse::<Reference>().is_err());
        assert!(matches!(
            "sha256:short".parse::<Reference>(),
            Err(RegistryError::InvalidDigest(_))
        ));
    }

    #[test]
    fn scope_names_round_trip_through_the_resolver() {
        let resolver = resolver();
        let quay = resolver.resolve("quay.io/coreos/etcd").unwrap();
        let name = resolver.scope_name(&quay.upstream, &quay.repository);
        assert_eq!(name, "quay.io/coreos/etcd");

        let hub = resolver.resolve("library/python").unwrap();
        assert_eq!(
            resolver.scope_name(&hub.upstream, &hub.repository),
            "library/python"
        );
    }
}
