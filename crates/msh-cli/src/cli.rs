//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the configuration and its PModes
    Check,
    /// Score a user message against the configured receiving PModes
    Resolve {
        /// User message as JSON, or a path to a JSON file
        #[arg(short, long)]
        message: String,
    },
    /// Run one reception awareness and one retry sweep over a fixture
    Sweep {
        /// Path to the JSON fixture of in-flight messages
        #[arg(short, long)]
        fixture: String,
    },
    /// Print an example configuration file
    ExampleConfig,
}
