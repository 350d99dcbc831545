//! webprobe CLI - Main Entry Point
//!
//! Exit codes: 0 when every scenario passed, 1 when any scenario failed,
//! 2 when the harness itself could not run.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use webprobe_cli::commands::{config, list, run};
use webprobe_cli::output::{self, print_error};
use webprobe_common::{default_config_path, HarnessConfig};

/// webprobe - browser end-to-end scenarios with request interception
#[derive(Parser)]
#[command(name = "webprobe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value_os_t = default_config_path(), env = "WEBPROBE_CONFIG", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenario files
    Run(run::RunArgs),

    /// List scenarios or commands
    #[command(subcommand)]
    List(list::ListCommands),

    /// Inspect or create configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    let mut harness_config = HarnessConfig::load(&cli.config)?;
    harness_config.apply_env_vars(std::env::vars());

    match cli.command {
        Commands::Run(args) => return run::execute(args, harness_config, cli.format).await,
        Commands::List(cmd) => list::execute(cmd, harness_config, cli.format).await?,
        Commands::Config(cmd) => config::execute(cmd, harness_config, cli.format).await?,
        Commands::Version => println!("webprobe v{}", webprobe_common::VERSION),
    }
    Ok(true)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let code = match dispatch(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            print_error(&format!("{:#}", e));
            2
        }
    };
    std::process::exit(code);
}
