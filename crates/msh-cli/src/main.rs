//! msh - offline tooling for the AS4 message service handler

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use msh_cli::{
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::{AppConfig, LogConfig},
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    if matches!(cli.command, Commands::ExampleConfig) {
        print!("{}", AppConfig::example_config());
        return Ok(());
    }

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            setup_logging(cli.verbose, &LogConfig::default());
            error!("{}", e);
            std::process::exit(2);
        }
    };
    setup_logging(cli.verbose, &config.log);
    info!(config = ?cli.config, "Configuration loaded");

    if let Err(e) = CommandDispatcher::execute(cli, config).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging from the configured level; `--verbose` and `RUST_LOG` take precedence
fn setup_logging(verbose: bool, log: &LogConfig) {
    let level = if verbose { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(log.with_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
