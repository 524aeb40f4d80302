//! msh CLI library
//!
//! Offline tooling around the message service handler: configuration
//! checks, PMode resolution dry runs and reliability sweeps over fixtures.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::{CommandDispatcher, InFlightMessage, SendOutcomeFixture, SweepFixture};
pub use config::{AppConfig, ConfigError, LogConfig};
pub use error::{CliError, Result};
