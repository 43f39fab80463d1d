//! linkhub-server: route packages between identified links.
//!
//! Run with a config file:
//!   linkhub-server --config hub.toml
//!
//! Or with flags:
//!   LINKHUB_SECRET=s3cret linkhub-server --address 0.0.0.0 --port 44444

use clap::Parser;
use linkhub_server::{Hub, HubConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "linkhub-server", version, about = "Routing hub for linkhub links")]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, overrides the config file.
    #[arg(long)]
    address: Option<String>,

    /// Port to bind, overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Secret links must present, overrides the config file.
    #[arg(long, env = "LINKHUB_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<HubConfig> {
        let mut config = match &self.config {
            Some(path) => HubConfig::load(path)?,
            None => HubConfig::default(),
        };
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secret) = self.secret {
            config.secret = secret;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("linkhub_server=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Args::parse().into_config()?;
    tracing::info!("Starting hub on {}", config.bind_addr());

    let hub = Hub::new(config);
    tokio::select! {
        result = hub.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
