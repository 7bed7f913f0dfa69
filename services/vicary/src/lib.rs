//! # Vicary: a pull-through cache for container registries
//!
//! Vicary speaks the read half of the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec)
//! to image clients, and serves manifests and blobs from local storage,
//! fetching them from an upstream registry on a miss.
//!
//! ## Features
//!
//! - Several upstreams, selected by a host prefix on the repository path
//!   (`quay.io/org/image`), with unprefixed paths going to a default upstream
//! - One upstream fetch per artifact, however many clients ask for it at once
//! - Digest verification before anything is stored
//! - Bearer token issuance for clients, and token exchange with upstreams
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use vicary::{Config, GatewayBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = GatewayBuilder::new()
//!     .config(Config::default())
//!     .storage(storage::MemoryStorage::new().into())
//!     .build()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, gateway).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod digest;
mod error;
mod gateway;
pub mod manifest;
pub mod resolve;
pub mod token;
pub mod upstream;

pub use api::GatewayBuilder;
pub use client::UpstreamClient;
pub use config::{Config, ConfigError};
pub use error::{RegistryError, RegistryResult};
