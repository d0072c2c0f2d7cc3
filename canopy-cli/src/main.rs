// Canopy CLI
// Run, inspect and validate pipeline tree definitions

mod commands;
mod config;
mod output;

use crate::commands::{RunArgs, ShowArgs, ValidateArgs};
use crate::config::CliConfig;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "canopy", version, about = "Run hierarchical pipeline trees")]
struct Cli {
    /// Config file (default: <config dir>/canopy/config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Show(ShowArgs),
    Validate(ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => {
            let config = CliConfig::resolve(cli.config.as_deref())?;
            commands::run::execute(args, &config).await
        }
        Commands::Show(args) => commands::show::execute(args),
        Commands::Validate(args) => commands::validate::execute(args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
