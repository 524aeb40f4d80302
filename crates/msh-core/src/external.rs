//! External collaborators
//!
//! Interfaces to everything the processing core consumes but does not
//! implement: the wire codec, cryptography, the HTTP transport, SMP lookups
//! and the business application's deliver/notify targets.

use async_trait::async_trait;

use crate::errors::{MshResult, TransportError};
use crate::ledger::{ExceptionRecord, MessageRecord};
use crate::message::As4Message;
use crate::pmode::{DynamicDiscoveryConfig, Method, SendingPModeFragment, SendingPMode};

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Serialized form of an AS4 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Converts between the message model and its wire form
pub trait MessageCodec: Send + Sync {
    /// Content type produced by `serialize`
    fn content_type(&self) -> &str;

    /// Whether `content_type` can be deserialized
    fn supports(&self, content_type: &str) -> bool;

    fn serialize(&self, message: &As4Message) -> MshResult<EncodedMessage>;

    fn deserialize(&self, content_type: &str, body: &[u8]) -> MshResult<As4Message>;
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

/// Signing and encryption of messages
///
/// Implementations set `is_signed` / `is_encrypted` on the message they
/// return and report failures as `MshError::Security` with an ebMS code.
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    async fn sign(&self, message: As4Message, certificate_ref: Option<&str>) -> MshResult<As4Message>;

    async fn verify(&self, message: &As4Message) -> MshResult<()>;

    async fn encrypt(&self, message: As4Message, public_key_ref: Option<&str>) -> MshResult<As4Message>;

    async fn decrypt(&self, message: As4Message, certificate_ref: Option<&str>) -> MshResult<As4Message>;
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Raw result of an HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Response {
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    Failed(TransportError),
}

/// Request handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub client_certificate_ref: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one HTTP POST; never retries on its own
    async fn send(&self, request: TransportRequest) -> TransportOutcome;
}

// ----------------------------------------------------------------------------
// Dynamic Discovery
// ----------------------------------------------------------------------------

/// SMP/SML lookup completing a sending PMode at send time
#[async_trait]
pub trait DynamicDiscovery: Send + Sync {
    async fn discover(
        &self,
        pmode: &SendingPMode,
        config: &DynamicDiscoveryConfig,
    ) -> MshResult<SendingPModeFragment>;
}

// ----------------------------------------------------------------------------
// Business Application Targets
// ----------------------------------------------------------------------------

/// Hand-off of a received user message to the business application
#[derive(Debug, Clone)]
pub struct DeliverMessage {
    pub record: MessageRecord,
    pub body: Vec<u8>,
    pub method: Method,
}

/// Notification of a receipt, error or exception
#[derive(Debug, Clone)]
pub enum NotifyMessage {
    Signal {
        record: MessageRecord,
        body: Vec<u8>,
        method: Method,
    },
    Exception {
        record: ExceptionRecord,
        method: Method,
    },
}

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, message: DeliverMessage) -> MshResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: NotifyMessage) -> MshResult<()>;
}
