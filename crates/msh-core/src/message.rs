//! AS4 message model
//!
//! Structural representation of the ebMS3 message units the pipeline works
//! with. Wire encoding (SOAP envelope, MIME multipart) is the job of a
//! [`MessageCodec`](crate::external::MessageCodec); this module only carries
//! the packaging attributes the processing core needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::{MessageType, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default message partition channel
pub const DEFAULT_MPC: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/defaultMPC";

/// Service value reserved for conformance test messages
pub const TEST_SERVICE: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/service";

/// Action value reserved for conformance test messages
pub const TEST_ACTION: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/test";

/// Generate a fresh ebMS message id
pub fn new_message_id() -> String {
    format!("{}@msh", Uuid::new_v4())
}

// ----------------------------------------------------------------------------
// Packaging Attributes
// ----------------------------------------------------------------------------

/// Party identifier with optional type qualifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_type: Option<String>,
}

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            party_type: None,
        }
    }
}

/// Sending or receiving party of a user message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub role: String,
    pub party_ids: Vec<PartyId>,
}

impl Party {
    pub fn new(role: impl Into<String>, party_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_ids: vec![PartyId::new(party_id)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_empty() && self.party_ids.is_empty()
    }
}

/// Business service the message belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

impl Service {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            service_type: None,
        }
    }
}

/// Agreement governing the exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementRef {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_type: Option<String>,
    /// Explicit PMode id reference (`AgreementRef/@pmode`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmode_id: Option<String>,
}

/// Collaboration information of a user message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_ref: Option<AgreementRef>,
    pub service: Service,
    pub action: String,
    #[serde(default)]
    pub conversation_id: String,
}

/// Reference to a payload carried by a user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub href: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

// ----------------------------------------------------------------------------
// User Message
// ----------------------------------------------------------------------------

/// Business message unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_to_message_id: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default = "default_mpc")]
    pub mpc: String,
    pub sender: Party,
    pub receiver: Party,
    pub collaboration: CollaborationInfo,
    #[serde(default)]
    pub payloads: Vec<PartInfo>,
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
}

fn default_mpc() -> String {
    DEFAULT_MPC.to_string()
}

impl UserMessage {
    /// Create a user message with a fresh id on the default MPC
    pub fn new(sender: Party, receiver: Party, service: Service, action: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            ref_to_message_id: None,
            timestamp: Timestamp::now(),
            mpc: default_mpc(),
            sender,
            receiver,
            collaboration: CollaborationInfo {
                agreement_ref: None,
                service,
                action: action.into(),
                conversation_id: "1".to_string(),
            },
            payloads: Vec::new(),
            message_properties: BTreeMap::new(),
        }
    }

    /// Whether the Service/Action pair marks this as a conformance test message
    pub fn is_test_message(&self) -> bool {
        self.collaboration.service.value == TEST_SERVICE && self.collaboration.action == TEST_ACTION
    }
}

// ----------------------------------------------------------------------------
// Error Codes
// ----------------------------------------------------------------------------

/// Severity of an ebMS error line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Failure,
}

/// Stable ebMS3 error codes reported to trading partners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ValueNotRecognized,
    ValueInconsistent,
    Other,
    EmptyMessagePartitionChannel,
    InvalidHeader,
    ProcessingModeMismatch,
    FailedAuthentication,
    FailedDecryption,
    PolicyNoncompliance,
    DeliveryFailure,
    MissingReceipt,
}

impl ErrorCode {
    /// Wire code, e.g. `EBMS:0010`
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::ValueNotRecognized => "EBMS:0001",
            ErrorCode::ValueInconsistent => "EBMS:0003",
            ErrorCode::Other => "EBMS:0004",
            ErrorCode::EmptyMessagePartitionChannel => "EBMS:0006",
            ErrorCode::InvalidHeader => "EBMS:0009",
            ErrorCode::ProcessingModeMismatch => "EBMS:0010",
            ErrorCode::FailedAuthentication => "EBMS:0101",
            ErrorCode::FailedDecryption => "EBMS:0102",
            ErrorCode::PolicyNoncompliance => "EBMS:0103",
            ErrorCode::DeliveryFailure => "EBMS:0202",
            ErrorCode::MissingReceipt => "EBMS:0301",
        }
    }

    /// Short description alias carried alongside the code
    pub fn short_description(&self) -> &'static str {
        match self {
            ErrorCode::ValueNotRecognized => "ValueNotRecognized",
            ErrorCode::ValueInconsistent => "ValueInconsistent",
            ErrorCode::Other => "Other",
            ErrorCode::EmptyMessagePartitionChannel => "EmptyMessagePartitionChannel",
            ErrorCode::InvalidHeader => "InvalidHeader",
            ErrorCode::ProcessingModeMismatch => "ProcessingModeMismatch",
            ErrorCode::FailedAuthentication => "FailedAuthentication",
            ErrorCode::FailedDecryption => "FailedDecryption",
            ErrorCode::PolicyNoncompliance => "PolicyNoncompliance",
            ErrorCode::DeliveryFailure => "DeliveryFailure",
            ErrorCode::MissingReceipt => "MissingReceipt",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::EmptyMessagePartitionChannel => Severity::Warning,
            _ => Severity::Failure,
        }
    }
}

/// Single error entry inside an Error signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLine {
    pub error_code: ErrorCode,
    pub severity: Severity,
    pub short_description: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_to_message_id: Option<String>,
}

impl ErrorLine {
    pub fn new(error_code: ErrorCode, detail: impl Into<String>, ref_to: Option<String>) -> Self {
        Self {
            error_code,
            severity: error_code.severity(),
            short_description: error_code.short_description().to_string(),
            detail: detail.into(),
            ref_to_message_id: ref_to,
        }
    }
}

// ----------------------------------------------------------------------------
// Signal Messages
// ----------------------------------------------------------------------------

/// Routing metadata carried by multi-hop signals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingInput {
    pub mpc: String,
    #[serde(default)]
    pub user_message_ref: Option<String>,
}

/// Acknowledgement of a received user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub ref_to_message_id: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multihop: Option<RoutingInput>,
}

/// Negative acknowledgement / processing error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_to_message_id: Option<String>,
    pub timestamp: Timestamp,
    pub errors: Vec<ErrorLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multihop: Option<RoutingInput>,
}

impl ErrorSignal {
    /// Whether this is the "empty mailbox" answer to a PullRequest
    pub fn is_pull_request_warning(&self) -> bool {
        self.errors
            .iter()
            .all(|line| line.error_code == ErrorCode::EmptyMessagePartitionChannel)
            && !self.errors.is_empty()
    }
}

/// Request for the next user message waiting on an MPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub message_id: String,
    pub mpc: String,
    pub timestamp: Timestamp,
}

/// Signal message units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalMessage {
    Receipt(Receipt),
    Error(ErrorSignal),
    PullRequest(PullRequest),
}

impl SignalMessage {
    /// Build a receipt for a received user message
    pub fn receipt_for(user_message: &UserMessage, now: Timestamp) -> Self {
        SignalMessage::Receipt(Receipt {
            message_id: new_message_id(),
            ref_to_message_id: user_message.message_id.clone(),
            timestamp: now,
            multihop: None,
        })
    }

    /// Build an error signal with a single error line
    pub fn error_for(ref_to: Option<String>, code: ErrorCode, detail: impl Into<String>, now: Timestamp) -> Self {
        SignalMessage::Error(ErrorSignal {
            message_id: new_message_id(),
            ref_to_message_id: ref_to.clone(),
            timestamp: now,
            errors: vec![ErrorLine::new(code, detail, ref_to)],
            multihop: None,
        })
    }

    /// Build the "nothing to pull" warning for an MPC
    pub fn pull_request_error(pull_request: &PullRequest, now: Timestamp) -> Self {
        Self::error_for(
            Some(pull_request.message_id.clone()),
            ErrorCode::EmptyMessagePartitionChannel,
            format!("No message available for MPC {}", pull_request.mpc),
            now,
        )
    }

    pub fn message_id(&self) -> &str {
        match self {
            SignalMessage::Receipt(r) => &r.message_id,
            SignalMessage::Error(e) => &e.message_id,
            SignalMessage::PullRequest(p) => &p.message_id,
        }
    }

    pub fn ref_to_message_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Receipt(r) => Some(&r.ref_to_message_id),
            SignalMessage::Error(e) => e.ref_to_message_id.as_deref(),
            SignalMessage::PullRequest(_) => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SignalMessage::Receipt(_) => MessageType::Receipt,
            SignalMessage::Error(_) => MessageType::Error,
            SignalMessage::PullRequest(_) => MessageType::PullRequest,
        }
    }

    /// Whether the signal carries multi-hop routing information
    pub fn is_multihop(&self) -> bool {
        match self {
            SignalMessage::Receipt(r) => r.multihop.is_some(),
            SignalMessage::Error(e) => e.multihop.is_some(),
            SignalMessage::PullRequest(_) => false,
        }
    }
}

// ----------------------------------------------------------------------------
// AS4 Message
// ----------------------------------------------------------------------------

/// A single ebMS message unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum MessageUnit {
    User(UserMessage),
    Signal(SignalMessage),
}

impl MessageUnit {
    pub fn message_id(&self) -> &str {
        match self {
            MessageUnit::User(u) => &u.message_id,
            MessageUnit::Signal(s) => s.message_id(),
        }
    }

    pub fn ref_to_message_id(&self) -> Option<&str> {
        match self {
            MessageUnit::User(u) => u.ref_to_message_id.as_deref(),
            MessageUnit::Signal(s) => s.ref_to_message_id(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageUnit::User(_) => MessageType::UserMessage,
            MessageUnit::Signal(s) => s.message_type(),
        }
    }
}

/// Envelope-level message: one or more bundled message units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct As4Message {
    pub message_units: Vec<MessageUnit>,
    #[serde(default)]
    pub is_signed: bool,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl As4Message {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_unit(unit: MessageUnit) -> Self {
        Self {
            message_units: vec![unit],
            is_signed: false,
            is_encrypted: false,
        }
    }

    pub fn from_user_message(user_message: UserMessage) -> Self {
        Self::with_unit(MessageUnit::User(user_message))
    }

    pub fn from_signal(signal: SignalMessage) -> Self {
        Self::with_unit(MessageUnit::Signal(signal))
    }

    /// Bundle an additional message unit into the same envelope
    pub fn add_unit(&mut self, unit: MessageUnit) {
        self.message_units.push(unit);
    }

    pub fn is_empty(&self) -> bool {
        self.message_units.is_empty()
    }

    /// The first message unit determines how the envelope is routed
    pub fn primary_unit(&self) -> Option<&MessageUnit> {
        self.message_units.first()
    }

    pub fn primary_message_id(&self) -> Option<&str> {
        self.primary_unit().map(MessageUnit::message_id)
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &UserMessage> {
        self.message_units.iter().filter_map(|unit| match unit {
            MessageUnit::User(u) => Some(u),
            MessageUnit::Signal(_) => None,
        })
    }

    pub fn signal_messages(&self) -> impl Iterator<Item = &SignalMessage> {
        self.message_units.iter().filter_map(|unit| match unit {
            MessageUnit::Signal(s) => Some(s),
            MessageUnit::User(_) => None,
        })
    }

    pub fn pull_request(&self) -> Option<&PullRequest> {
        self.signal_messages().find_map(|signal| match signal {
            SignalMessage::PullRequest(pr) => Some(pr),
            _ => None,
        })
    }

    pub fn first_user_message(&self) -> Option<&UserMessage> {
        self.user_messages().next()
    }

    pub fn is_user_message(&self) -> bool {
        matches!(self.primary_unit(), Some(MessageUnit::User(_)))
    }

    pub fn is_signal_message(&self) -> bool {
        matches!(self.primary_unit(), Some(MessageUnit::Signal(_)))
    }

    pub fn is_pull_request(&self) -> bool {
        matches!(
            self.primary_unit(),
            Some(MessageUnit::Signal(SignalMessage::PullRequest(_)))
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user_message() -> UserMessage {
        UserMessage::new(
            Party::new("Sender", "org:a"),
            Party::new("Receiver", "org:b"),
            Service::new("invoice"),
            "Submit",
        )
    }

    #[test]
    fn test_test_message_detection() {
        let mut message = sample_user_message();
        assert!(!message.is_test_message());

        message.collaboration.service = Service::new(TEST_SERVICE);
        message.collaboration.action = TEST_ACTION.to_string();
        assert!(message.is_test_message());
    }

    #[test]
    fn test_signal_accessors() {
        let user = sample_user_message();
        let receipt = SignalMessage::receipt_for(&user, Timestamp::new(5));
        assert_eq!(receipt.ref_to_message_id(), Some(user.message_id.as_str()));
        assert_eq!(receipt.message_type(), MessageType::Receipt);

        let pr = PullRequest {
            message_id: new_message_id(),
            mpc: "mpc:a".to_string(),
            timestamp: Timestamp::new(1),
        };
        match SignalMessage::pull_request_error(&pr, Timestamp::new(2)) {
            SignalMessage::Error(error) => {
                assert!(error.is_pull_request_warning());
                assert_eq!(error.errors[0].error_code.code(), "EBMS:0006");
                assert_eq!(error.errors[0].severity, Severity::Warning);
            }
            other => panic!("expected error signal, got {:?}", other),
        }
    }

    #[test]
    fn test_bundled_message_views() {
        let user = sample_user_message();
        let pr = PullRequest {
            message_id: new_message_id(),
            mpc: DEFAULT_MPC.to_string(),
            timestamp: Timestamp::new(1),
        };
        let mut message = As4Message::from_signal(SignalMessage::PullRequest(pr));
        message.add_unit(MessageUnit::Signal(SignalMessage::receipt_for(&user, Timestamp::new(3))));

        assert!(message.is_pull_request());
        assert!(message.is_signal_message());
        assert_eq!(message.signal_messages().count(), 2);
        assert_eq!(message.user_messages().count(), 0);
        assert!(message.pull_request().is_some());
    }
}
