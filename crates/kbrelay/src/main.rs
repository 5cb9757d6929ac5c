//! kbrelay daemon - knowledge-grounded chat completion relay

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kbrelay::config::Config;
use kbrelay::error::Result;
use kbrelay::proxy::{AppState, RelayServer};

/// kbrelay - grounds every chat request in a cached knowledge base
#[derive(Parser)]
#[command(name = "kbrelay")]
#[command(about = "A chat-completion relay that attaches a cached knowledge base to every request")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
    /// Print the effective configuration and exit
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::CheckConfig) => check_config(cli.config),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kbrelay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::from_file(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".kbrelay").join("config.toml")),
        dirs::config_dir().map(|c| c.join("kbrelay").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::from_file(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("listen_addr: {}", config.server.listen_addr);
    println!("upstream:    {}", config.upstream.url);
    println!("model:       {}", config.upstream.defaults.model);
    println!("default mode: {}", config.default_mode);

    let mut modes: Vec<_> = config.modes.iter().collect();
    modes.sort_by(|a, b| a.0.cmp(b.0));
    for (name, mode) in modes {
        println!("mode {name}: datasets [{}]", mode.datasets.join(", "));
    }
    for dataset in &config.knowledge.datasets {
        println!(
            "dataset {}: {} (ttl {}s)",
            dataset.id,
            dataset.url,
            config.knowledge.ttl_for(&dataset.id).as_secs()
        );
    }
    Ok(())
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting kbrelay");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let state = AppState::from_config(config)?;
    RelayServer::new(state).serve().await?;

    tracing::info!("kbrelay stopped");
    Ok(())
}
