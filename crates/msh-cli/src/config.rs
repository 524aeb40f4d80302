//! msh CLI Configuration Management
//!
//! Configuration is layered with figment, later layers winning:
//! - Built-in defaults
//! - A TOML file (`msh.toml`, or the path given on the command line)
//! - Environment variables prefixed with `MSH_`, nested keys separated by
//!   a double underscore (`MSH_LOG__LEVEL=debug`, `MSH_AGENTS__BATCH_SIZE=50`)

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use msh_core::pmode::InMemoryPModeStore;
use msh_core::MshConfig;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "msh.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "MSH_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Loading(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Logging options of the binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level, overridden by `RUST_LOG` directives when set
    pub level: String,
    /// Include the module path of each event
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

/// Complete configuration of the `msh` binary
///
/// The handler settings sit at the top level of the file next to `[log]`,
/// exactly as [`MshConfig`] lays them out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    #[serde(flatten)]
    pub msh: MshConfig,
}

impl AppConfig {
    /// Load from the given file, or `msh.toml` when present, plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(ConfigError::Loading(format!("{} does not exist", path)));
                }
                Toml::file(path)
            }
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };

        let figment = Self::defaults()
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Load from TOML text, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Self::defaults().merge(Toml::string(toml)))
    }

    fn defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the handler settings and that every PMode reference resolves
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Unknown log level {}, expected one of {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            )));
        }

        self.msh
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        InMemoryPModeStore::from_config(&self.msh.pmodes)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Annotated configuration to start from
    pub fn example_config() -> String {
        r#"# msh configuration

[log]
level = "info"

[agents]
poll_interval_ms = 1000
batch_size = 20
awareness_sweep_interval_ms = 5000
retry_sweep_interval_ms = 5000

[resolver]
threshold = 10

[receive]
max_message_size = 10485760

# Messages we send to a partner
[[pmodes.sending]]
id = "send-invoice"
mep = "Push"

[pmodes.sending.push_configuration]
url = "https://partner.example.com/as4"

[pmodes.sending.message_packaging.party_info.from]
role = "Sender"
party_ids = [{ id = "org:sender" }]

[pmodes.sending.message_packaging.party_info.to]
role = "Receiver"
party_ids = [{ id = "org:receiver" }]

[pmodes.sending.reliability.reception_awareness]
is_enabled = true
retry_count = 3
retry_interval_ms = 60000

[pmodes.sending.receipt_handling]
notify_message_producer = true

# Messages a partner sends to us
[[pmodes.receiving]]
id = "receive-invoice"

[pmodes.receiving.message_packaging.party_info.from]
role = "Sender"
party_ids = [{ id = "org:sender" }]

[pmodes.receiving.message_packaging.collaboration]
action = "Submit"

[pmodes.receiving.message_packaging.collaboration.service]
value = "urn:services:invoice"

[pmodes.receiving.deliver]
is_enabled = true

[pmodes.receiving.deliver.delivery_method]
method_type = "FILE"
"#
        .to_string()
    }
}
