//! replaykit command line
//!
//! `replaykit assets` runs the asset ingestion loop over a spool of queue
//! records; `replaykit decode` prints the annotated messages of one raw
//! batch as JSON lines.

use anyhow::Context;
use clap::{Parser, Subcommand};
use replaykit_core::config::{Config, LogFormat};
use replaykit_core::logging::init_logging;
use std::path::PathBuf;
use std::process::ExitCode;

mod assets;
mod decode;

#[derive(Debug, Parser)]
#[command(name = "replaykit", version, about = "Session-replay batch decoding and asset caching")]
struct Cli {
    /// Configuration file (defaults to ./replaykit.toml when present)
    #[arg(long, global = true, env = "REPLAYKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume queue records and plan asset caching jobs
    Assets(assets::Args),

    /// Decode one batch file and print its messages
    Decode(decode::Args),
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.log_config()).context("initializing logging")?;

    match cli.command {
        Command::Assets(args) => assets::run(config, args),
        Command::Decode(args) => decode::run(&config, &args),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "replaykit failed");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
