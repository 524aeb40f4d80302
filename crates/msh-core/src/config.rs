//! Centralized Configuration Management
//!
//! All configuration structures used by the processing core and the runtime
//! agents live here so the binary can load them from a single file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{MshError, MshResult};
use crate::pmode::{ReceivingPMode, ScoringWeights, SendingPMode};

// ----------------------------------------------------------------------------
// Agent Configuration
// ----------------------------------------------------------------------------

/// Polling behaviour of the background agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Interval between ledger polls for ToBeSent/ToBeDelivered/ToBeNotified work
    pub poll_interval_ms: u64,
    /// Maximum records claimed per poll
    pub batch_size: usize,
    /// Interval between reception awareness sweeps
    pub awareness_sweep_interval_ms: u64,
    /// Interval between retry sweeps
    pub retry_sweep_interval_ms: u64,
    pub send_enabled: bool,
    pub deliver_enabled: bool,
    pub notify_enabled: bool,
    pub pull_enabled: bool,
    /// Interval at which the supervisor checks agent health
    pub monitoring_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 20,
            awareness_sweep_interval_ms: 5_000,
            retry_sweep_interval_ms: 5_000,
            send_enabled: true,
            deliver_enabled: true,
            notify_enabled: true,
            pull_enabled: true,
            monitoring_interval_ms: 10_000,
        }
    }
}

impl AgentConfig {
    /// Fast polling for tests
    pub fn testing() -> Self {
        Self {
            poll_interval_ms: 10,
            batch_size: 10,
            awareness_sweep_interval_ms: 10,
            retry_sweep_interval_ms: 10,
            monitoring_interval_ms: 50,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn awareness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.awareness_sweep_interval_ms)
    }

    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_interval_ms)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Receive Configuration
// ----------------------------------------------------------------------------

/// Limits and options for the receive boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Bodies larger than this are rejected before deserialization
    pub max_message_size: usize,
    /// Persist received messages in the body store; deliver and notify read them back
    pub store_bodies: bool,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            store_bodies: true,
        }
    }
}

// ----------------------------------------------------------------------------
// PMode Configuration
// ----------------------------------------------------------------------------

/// Configured PModes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeConfig {
    pub receiving: Vec<ReceivingPMode>,
    pub sending: Vec<SendingPMode>,
}

/// PullRequest emitted periodically by the pull agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestConfig {
    /// Sending PMode whose push url the PullRequest is sent to
    pub sending_pmode_id: String,
    /// MPC to pull from; defaults to the PMode's MPC
    #[serde(default)]
    pub mpc: Option<String>,
    #[serde(default = "default_pull_interval_ms")]
    pub interval_ms: u64,
}

fn default_pull_interval_ms() -> u64 {
    5_000
}

impl PullRequestConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ----------------------------------------------------------------------------
// MSH Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of a message service handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MshConfig {
    pub agents: AgentConfig,
    pub resolver: ScoringWeights,
    pub receive: ReceiveConfig,
    pub pmodes: PModeConfig,
    pub pull: Vec<PullRequestConfig>,
}

impl MshConfig {
    /// Configuration tuned for tests: fast agents, no PModes
    pub fn testing() -> Self {
        Self {
            agents: AgentConfig::testing(),
            ..Self::default()
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> MshResult<()> {
        if self.agents.batch_size == 0 {
            return Err(MshError::config_error("agents.batch_size must be positive"));
        }
        if self.agents.poll_interval_ms == 0 {
            return Err(MshError::config_error("agents.poll_interval_ms must be positive"));
        }
        if self.receive.max_message_size == 0 {
            return Err(MshError::config_error("receive.max_message_size must be positive"));
        }
        self.resolver.validate()?;

        for pmode in &self.pmodes.receiving {
            for retry in [&pmode.deliver.reliability, &pmode.exception_handling.reliability] {
                if retry.is_enabled && retry.retry_interval_ms == 0 {
                    return Err(MshError::config_error(format!(
                        "Receiving PMode {} has a zero retry interval",
                        pmode.id
                    )));
                }
            }
        }

        for pmode in &self.pmodes.sending {
            let handlings = [&pmode.receipt_handling, &pmode.error_handling, &pmode.exception_handling];
            let zero_interval = handlings
                .iter()
                .map(|h| &h.reliability)
                .chain(std::iter::once(&pmode.reliability.retry))
                .any(|retry| retry.is_enabled && retry.retry_interval_ms == 0);
            if zero_interval {
                return Err(MshError::config_error(format!(
                    "Sending PMode {} has a zero retry interval",
                    pmode.id
                )));
            }
        }

        for pull in &self.pull {
            if pull.interval_ms == 0 {
                return Err(MshError::config_error(format!(
                    "Pull configuration for {} has a zero interval",
                    pull.sending_pmode_id
                )));
            }
            if !self.pmodes.sending.iter().any(|p| p.id == pull.sending_pmode_id) {
                return Err(MshError::config_error(format!(
                    "Pull configuration references unknown sending PMode {}",
                    pull.sending_pmode_id
                )));
            }
        }
        Ok(())
    }
}
