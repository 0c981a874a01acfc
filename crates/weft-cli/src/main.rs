//! weft CLI
//!
//! One binary for both peers:
//! - `serve` accepts tunnel connections
//! - `connect` dials a peer and forwards ports through it

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft::commands::{self, ConnectOptions};
use weft::output::print_error;
use weft_services::user::{LOCAL_FORWARD, REMOTE_FORWARD};

#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about = "Multiplexed TCP port forwarding over one connection")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log filter (e.g. "debug" or "weft_mux=trace"); overrides -v/-q
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnel connections from peers
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Connect to a peer and set up port forwardings
    Connect {
        /// Peer address (overrides config)
        #[arg(short, long)]
        server: Option<String>,

        #[arg(
            short = 'R',
            value_name = REMOTE_FORWARD.value_name,
            help = REMOTE_FORWARD.description
        )]
        remote: Vec<String>,

        #[arg(
            short = 'L',
            value_name = LOCAL_FORWARD.value_name,
            help = LOCAL_FORWARD.description
        )]
        local: Vec<String>,

        /// Print the forwarding report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| log_level.into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_ref();
    match cli.command {
        Commands::Serve { listen } => {
            let config = commands::load_endpoint_config(config_path)?;
            commands::serve_command(config, listen).await
        }
        Commands::Connect {
            server,
            remote,
            local,
            json,
        } => {
            let config = commands::load_endpoint_config(config_path)?;
            let options = ConnectOptions {
                server,
                remote_forwards: remote,
                local_forwards: local,
                json,
            };
            commands::connect_command(config, options).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(config_path),
            ConfigAction::Path => {
                commands::config_path(config_path);
                Ok(())
            }
            ConfigAction::Init { force } => commands::config_init(config_path, force),
        },
    }
}
