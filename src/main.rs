//! Stub Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use stub_server::{StubServer, StubServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "stub-server",
    about = "Configurable stub HTTP server - rule-driven fixtures and upstream proxying",
    version
)]
struct Args {
    /// Path to configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, default_value = "stubs.yaml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value_t = 12306)]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let sample_config = include_str!("../demos/stubs.yaml");
        println!("{}", sample_config);
        return Ok(());
    }

    info!(path = ?args.config, "Loading configuration");
    let config = StubServerConfig::from_file(&args.config)?;

    if args.validate {
        println!(
            "Configuration is valid ({} rules defined)",
            config.rules.len()
        );
        return Ok(());
    }

    let mut server = StubServer::new(config)?;
    server
        .start_on(SocketAddr::new(args.host, args.port))
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop().await;

    Ok(())
}
