use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hive_server::config::BusKind;
use hive_server::store::DataContext;
use hive_server::{Hub, MemoryStore, ServerConfig, ws};

#[derive(Parser, Debug)]
#[command(author, version, about = "hive device hub")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "hive.toml")]
    config: PathBuf,

    /// Address to serve WebSocket connections on (overrides the config).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Bus transport (overrides the config).
    #[arg(long, value_enum)]
    bus: Option<BusKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive_server=info,hive_bus=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(kind) = args.bus {
        config.bus.kind = kind;
    }

    let store: Arc<dyn DataContext> = Arc::new(MemoryStore::new());
    config.seed.apply(store.as_ref()).context("failed to seed store")?;

    let transport = config.bus.build_transport()?;
    let hub = Hub::start(&config, store, transport).await?;

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(listen = %config.listen, bus = ?config.bus.kind, "hive-server listening");

    axum::serve(
        listener,
        ws::app(hub.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
    })
    .await
    .context("server failed")?;

    hub.stop().await;
    Ok(())
}
