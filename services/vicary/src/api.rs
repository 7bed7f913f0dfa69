//! Gateway builder and router

use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheStore;
use crate::client::UpstreamClient;
use crate::config::{Config, ConfigError};
use crate::gateway::Gateway;
use crate::resolve::ReferenceResolver;
use crate::token::TokenBroker;
use crate::upstream::UpstreamFetcher;

/// Gateway builder for configuring and creating the registry cache service
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    config: Config,
    storage: Option<storage::Storage>,
    client: Option<UpstreamClient>,
}

impl GatewayBuilder {
    /// Create a new gateway builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the storage backend, overriding the configured one
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the client used to reach upstreams
    pub fn client(mut self, client: UpstreamClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the gateway service
    ///
    /// Returns a Router that can be served with any tower-compatible server.
    /// Without an explicit storage backend, an in-memory one is used.
    pub fn build(self) -> Result<Router, ConfigError> {
        let config = self.config;
        let resolver = ReferenceResolver::new(&config)?;

        let client = self
            .client
            .unwrap_or_else(|| UpstreamClient::new(config.upstream_timeout()));
        let broker = TokenBroker::new(client.clone(), config.token_lifetime());
        let fetcher = UpstreamFetcher::new(client, broker.clone());
        let store = CacheStore::new(self.storage.unwrap_or_default(), config.manifest_ttl());

        let gateway = Gateway::new(&config, resolver, broker, store, fetcher);

        Ok(crate::gateway::router()
            .with_state(gateway)
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("docker-distribution-api-version"),
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(TraceLayer::new_for_http()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    #[test]
    fn test_builder() {
        let _gateway = GatewayBuilder::new()
            .storage(storage::MemoryStorage::new().into())
            .client(UpstreamClient::stalled())
            .build()
            .unwrap();
    }

    #[test]
    fn builder_rejects_unknown_default() {
        let config = Config {
            default_upstream: "missing".into(),
            upstreams: vec![UpstreamConfig::new("quay.io", "quay.io")],
            ..Config::default()
        };
        let error = GatewayBuilder::new()
            .config(config)
            .client(UpstreamClient::stalled())
            .build()
            .unwrap_err();
        assert!(matches!(error, ConfigError::UnknownDefaultUpstream(_)));
    }
}
