//! The `vicary` server binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr as _;
use storage::StorageConfig;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};
use vicary::{Config, GatewayBuilder};

/// Pull-through cache for container registries.
#[derive(Debug, Parser)]
#[command(name = "vicary", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "VICARY_PORT", default_value_t = 5000)]
    port: u16,

    /// Address to listen on.
    #[arg(long, env = "VICARY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Scheme clients use to reach this server (`http` or `https`).
    #[arg(long, env = "VICARY_SCHEME")]
    scheme: Option<String>,

    /// Directory for cached artifacts. Artifacts are kept in memory when unset.
    #[arg(long, env = "VICARY_STORE")]
    store: Option<Utf8PathBuf>,

    /// TOML configuration file.
    #[arg(long, env = "VICARY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn config(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(scheme) = &self.scheme {
            config.scheme = scheme.clone();
        }
        if let Some(path) = &self.store {
            config.storage = StorageConfig::Local { path: path.clone() };
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .with(tracing_error::ErrorLayer::default())
        .init();
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Listening for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.config().wrap_err("loading configuration")?;
    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("opening storage")?;
    tracing::info!(storage = storage.name(), "Storage ready");

    let app = GatewayBuilder::new()
        .config(config)
        .storage(storage)
        .build()?;

    let addr = SocketAddr::new(args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    tracing::info!("Vicary listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}
