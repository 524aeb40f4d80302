//! Processing Modes
//!
//! A PMode is the per-partner-relationship contract governing packaging,
//! reliability and security of an exchange. PModes are immutable snapshots:
//! once resolved they are attached to a messaging context behind an `Arc`, and
//! any override (for example dynamic discovery) produces a new value.

pub mod resolver;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::message::{AgreementRef, Party, Service};
use crate::types::Mep;

pub use resolver::{resolve_signal_pmode, PModeResolver, PModeScore, ScoringWeights};
pub use store::{InMemoryPModeStore, PModeProvider};

// ----------------------------------------------------------------------------
// Shared Building Blocks
// ----------------------------------------------------------------------------

/// Parties a PMode constrains (either side may be left open)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartyInfo {
    pub from: Option<Party>,
    pub to: Option<Party>,
}

/// Collaboration attributes a PMode constrains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeCollaboration {
    pub agreement_ref: Option<AgreementRef>,
    pub service: Option<Service>,
    pub action: Option<String>,
}

/// Packaging section shared by sending and receiving PModes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePackaging {
    pub party_info: PartyInfo,
    pub collaboration: PModeCollaboration,
    pub mpc: Option<String>,
}

/// Pluggable method description (deliver target, notify target, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Method {
    pub method_type: String,
    pub parameters: BTreeMap<String, String>,
}

/// Retry/backoff settings for deliver and notify side-effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub is_enabled: bool,
    /// Maximum number of retries after the first attempt
    pub retry_count: u32,
    /// Delay before the first retry
    pub retry_interval_ms: u64,
    /// Exponential backoff multiplier (1.0 keeps a fixed interval)
    pub backoff_multiplier: f32,
    /// Upper bound for the backoff delay
    pub max_retry_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            is_enabled: false,
            retry_count: 3,
            retry_interval_ms: 5_000,
            backoff_multiplier: 1.0,
            max_retry_interval_ms: 300_000,
        }
    }
}

impl RetryConfig {
    /// Enabled retry configuration with a fixed interval
    pub fn fixed(retry_count: u32, retry_interval: Duration) -> Self {
        Self {
            is_enabled: true,
            retry_count,
            retry_interval_ms: retry_interval.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Producer/consumer notification settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyHandling {
    pub notify_message_producer: bool,
    pub notify_method: Method,
    pub reliability: RetryConfig,
}

// ----------------------------------------------------------------------------
// Receiving PMode
// ----------------------------------------------------------------------------

/// How signals answering a received user message travel back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPattern {
    /// Synchronously on the HTTP response
    #[default]
    Response,
    /// Asynchronously, pushed to a callback url
    Callback,
    /// Bundled onto the next PullRequest for the same MPC
    PiggyBack,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyHandling {
    pub reply_pattern: ReplyPattern,
    /// Sending PMode used to push callback signals
    pub sending_pmode_id: Option<String>,
    /// Notification settings when errors are reported back to us for replies
    pub error_handling: NotifyHandling,
}

/// Consumer notification of failed receptions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveExceptionHandling {
    pub notify_message_consumer: bool,
    pub notify_method: Method,
    pub reliability: RetryConfig,
}

/// Whether a security feature must, may, or must not be present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityRequirement {
    #[default]
    Allowed,
    Required,
    Ignored,
    NotAllowed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveSecurity {
    pub signing_verification: SecurityRequirement,
    pub decryption: SecurityRequirement,
    pub decryption_certificate_ref: Option<String>,
}

/// Hand-off of received payloads to the business application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deliver {
    pub is_enabled: bool,
    pub delivery_method: Method,
    pub payload_reference_method: Method,
    pub reliability: RetryConfig,
}

/// PMode applied to inbound user messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceivingPMode {
    pub id: String,
    pub mep: Mep,
    pub message_packaging: MessagePackaging,
    pub reply_handling: ReplyHandling,
    pub exception_handling: ReceiveExceptionHandling,
    pub security: ReceiveSecurity,
    pub deliver: Deliver,
}

impl ReceivingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Sending PMode
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfiguration {
    pub is_enabled: bool,
    pub client_certificate_ref: Option<String>,
}

/// Where pushed messages are sent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfiguration {
    pub url: String,
    pub tls: TlsConfiguration,
}

/// Resend-until-acknowledged settings for pushed user messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceptionAwarenessConfig {
    pub is_enabled: bool,
    pub retry_count: u32,
    pub retry_interval_ms: u64,
}

impl Default for ReceptionAwarenessConfig {
    fn default() -> Self {
        Self {
            is_enabled: false,
            retry_count: 5,
            retry_interval_ms: 60_000,
        }
    }
}

impl ReceptionAwarenessConfig {
    pub fn enabled(retry_count: u32, retry_interval: Duration) -> Self {
        Self {
            is_enabled: true,
            retry_count,
            retry_interval_ms: retry_interval.as_millis() as u64,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendReliability {
    pub reception_awareness: ReceptionAwarenessConfig,
    /// Push retries for messages sent without reception awareness
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signing {
    pub is_enabled: bool,
    pub certificate_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Encryption {
    pub is_enabled: bool,
    pub public_key_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSecurity {
    pub signing: Signing,
    pub encryption: Encryption,
}

/// SMP/SML lookup settings used to complete a sending PMode at send time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicDiscoveryConfig {
    pub smp_profile: String,
    pub settings: BTreeMap<String, String>,
}

/// PMode fragment returned by dynamic discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingPModeFragment {
    pub url: Option<String>,
    pub receiver: Option<Party>,
    pub encryption_public_key_ref: Option<String>,
}

/// PMode applied to outbound messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingPMode {
    pub id: String,
    pub allow_override: bool,
    pub mep: Mep,
    pub push_configuration: Option<PushConfiguration>,
    pub message_packaging: MessagePackaging,
    pub reliability: SendReliability,
    pub receipt_handling: NotifyHandling,
    pub error_handling: NotifyHandling,
    pub exception_handling: NotifyHandling,
    pub security: SendSecurity,
    pub dynamic_discovery: Option<DynamicDiscoveryConfig>,
}

impl SendingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Destination url for pushed messages
    pub fn push_url(&self) -> Option<&str> {
        self.push_configuration
            .as_ref()
            .map(|push| push.url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// MPC outbound messages are placed on
    pub fn mpc(&self) -> &str {
        self.message_packaging
            .mpc
            .as_deref()
            .unwrap_or(crate::message::DEFAULT_MPC)
    }

    pub fn reception_awareness_enabled(&self) -> bool {
        self.mep == Mep::Push && self.reliability.reception_awareness.is_enabled
    }

    /// Produce a new PMode completed with a dynamic discovery result
    ///
    /// The resolved PMode this was called on is left untouched.
    pub fn with_discovered(&self, fragment: &SendingPModeFragment) -> SendingPMode {
        let mut completed = self.clone();
        if let Some(url) = &fragment.url {
            let push = completed.push_configuration.get_or_insert_with(PushConfiguration::default);
            push.url = url.clone();
        }
        if let Some(receiver) = &fragment.receiver {
            completed.message_packaging.party_info.to = Some(receiver.clone());
        }
        if let Some(key_ref) = &fragment.encryption_public_key_ref {
            completed.security.encryption.public_key_ref = Some(key_ref.clone());
        }
        completed
    }
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Serialize a PMode into the snapshot stored alongside a ledger record
pub fn to_snapshot<T: Serialize>(pmode: &T) -> serde_json::Result<String> {
    serde_json::to_string(pmode)
}

/// Restore a PMode from a stored snapshot
pub fn from_snapshot<T: for<'de> Deserialize<'de>>(snapshot: &str) -> serde_json::Result<T> {
    serde_json::from_str(snapshot)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
