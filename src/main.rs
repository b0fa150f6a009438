use clap::Parser;
use mcp_server::{Config, Server, Transport};
use std::{net::SocketAddr, path::PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LISTEN: &str = "127.0.0.1:7878";

#[derive(Debug, Parser)]
#[command(version, about = "Serves model context protocol sessions over TCP")]
struct Args {
    /// Address to listen on [default: 127.0.0.1:7878]
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Client integration name, e.g. `vscode`
    #[arg(long)]
    client: Option<String>,

    /// JSON file with server options
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("info,{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            Config::from_value(serde_json::from_str(&text)?)?
        }
        None => Config::default(),
    };
    if let Some(client) = args.client {
        config = config.with_client(client);
    }
    // The in-process transport is unreachable from other processes.
    let transport = match (args.listen, config.transport) {
        (Some(addr), _) => Transport::Tcp(addr),
        (None, Transport::Tcp(addr)) => Transport::Tcp(addr),
        (None, Transport::Memory) => DEFAULT_LISTEN.parse()?,
    };
    config = config.with_transport(transport);
    if !config.extra.is_empty() {
        let keys: Vec<_> = config.extra.keys().collect();
        tracing::debug!(?keys, "keeping unrecognized options");
    }

    let server = Server::new(config);
    server.start().await?;
    if let Some(addr) = server.local_addr().await {
        tracing::info!(%addr, client = %server.config().client, "listening");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}
