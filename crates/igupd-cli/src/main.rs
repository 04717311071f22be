mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::client::Client;
use cmd::schedule::ScheduleSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "igupd",
    about = "Scheduled A/B software update agent for embedded gateways",
    version,
    propagate_version = true
)]
struct Cli {
    /// Address of a running daemon's RPC façade
    #[arg(long, global = true, env = "IGUPD_URL", default_value = "http://127.0.0.1:7077")]
    url: String,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the update daemon in the foreground
    Run {
        /// Daemon configuration file
        #[arg(long, short = 'c', env = "IGUPD_CONFIG", default_value = igupd_core::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Offline schedule tools
    Schedule {
        #[command(subcommand)]
        subcommand: ScheduleSubcommand,
    },

    /// Send a configuration document (JSON text, or @path) to the daemon
    Configure { document: String },

    /// Report the update state, optionally starting an update check
    Check {
        /// Relaunch the installer if idle
        #[arg(long)]
        perform: bool,
    },

    /// Postpone a scheduled reboot
    Snooze {
        #[arg(allow_hyphen_values = true)]
        seconds: i64,
    },

    /// Show daemon status
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let client = Client::new(&cli.url);
    let result = match cli.command {
        Commands::Run { config } => cmd::run::run(&config),
        Commands::Schedule { subcommand } => cmd::schedule::run(subcommand, cli.json),
        Commands::Configure { document } => cmd::client::run_configure(&client, &document, cli.json),
        Commands::Check { perform } => cmd::client::run_check(&client, perform, cli.json),
        Commands::Snooze { seconds } => cmd::client::run_snooze(&client, seconds, cli.json),
        Commands::Status => cmd::client::run_status(&client, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
