//! Terrarium Relay Server
//!
//! Run with: cargo run -- serve
//!
//! # Configuration
//!
//! Settings come from the first config file found (`--config`, then
//! `<config_dir>/terrarium-relay/config.toml`, `/etc/terrarium-relay/config.toml`,
//! `./config.toml`), then `TERRARIUM_RELAY_*` environment variables, then
//! command-line flags. `RUST_LOG` overrides the configured log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use terrarium_relay::api::{serve, AppState};
use terrarium_relay::config::{generate_default_config, Config, LoggingConfig};
use terrarium_relay::upstream::UpstreamClient;

#[derive(Parser)]
#[command(name = "terrarium-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time terrarium telemetry relay")]
#[command(long_about = "Polls the terrarium API for every connected user and pushes\nthe latest readings of their terrariums to WebSocket clients.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay (default)
    Serve(ServeArgs),

    /// Print a commented default config file
    InitConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Default)]
pub struct ServeArgs {
    /// Config file (default: search the standard locations)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Terrarium API base URL
    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Poll period of each session (ms)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => run_server(args).await,
        Commands::InitConfig { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.upstream_url {
        config.upstream.base_url = url;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poller.poll_interval_ms = ms;
    }

    config.validate()?;
    init_tracing(&config.logging);

    tracing::info!("Starting terrarium relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        upstream = %config.upstream.base_url,
        poll_interval_ms = config.poller.poll_interval_ms,
        default_user = %config.poller.default_user,
        "Relay configured"
    );

    let source = Arc::new(UpstreamClient::new(config.upstream_config()));
    let api_config = config.api_config();
    let state = AppState::with_source(source, config.relay_config(), api_config.clone());

    serve(state, &api_config)
        .await
        .context("Relay server failed")?;

    tracing::info!("Terrarium relay stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("terrarium_relay={},tower_http={}", logging.level, logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);

    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
