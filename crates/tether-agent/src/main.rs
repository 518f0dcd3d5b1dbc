//! Tether Agent Binary
//!
//! Attaches to the configured controllers and serves their requests until
//! the last session ends or a termination signal arrives.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tether_agent::{Core, CoreConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tether-agent", version, about = "Remote agent runtime")]
struct Cli {
    /// Transport URIs to attach (tcp://host:port, stdio://)
    uris: Vec<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fixed runtime identity
    #[arg(long)]
    identity: Option<String>,

    /// Disable core dumps
    #[arg(long)]
    no_dump: bool,

    /// Blank the process name
    #[arg(long)]
    hide_name: bool,

    /// Keep sessions alive across quit and disconnects
    #[arg(long)]
    keep_alive: bool,

    /// Delay before reconnecting a dropped keep-alive session
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<CoreConfig> {
        let mut config = match &self.config {
            Some(path) => CoreConfig::from_file(path)?,
            None => CoreConfig::default(),
        };

        config.uris.extend(self.uris);
        if self.identity.is_some() {
            config.identity = self.identity;
        }
        config.no_dump |= self.no_dump;
        config.hide_name |= self.hide_name;
        config.keep_alive |= self.keep_alive;
        if let Some(delay) = self.reconnect_delay_ms {
            config.reconnect_delay_ms = delay;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tether-agent: {}", e);
            std::process::exit(1);
        }
    };

    // stdout may be a transport, logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Tether agent");

    let mut core = Core::with_builtins(config);
    if let Err(e) = core.start().await {
        error!("Startup failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = core.run().await {
        error!("Runtime error: {}", e);
        std::process::exit(1);
    }

    info!("Agent shutting down");
    Ok(())
}
