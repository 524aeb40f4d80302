//! Error types for the message service handler
//!
//! This module contains the error taxonomy used throughout the processing
//! core: ledger errors, transport errors, PMode resolution errors, and the
//! main `MshError` type that unifies them. Every error maps onto an
//! [`ErrorKind`] and, when it has to be reported to a partner, onto a stable
//! ebMS error code.

use serde::{Deserialize, Serialize};

use crate::message::ErrorCode;
use crate::types::{Direction, RecordId};

// ----------------------------------------------------------------------------
// Error Taxonomy
// ----------------------------------------------------------------------------

/// Classification that decides how a failure is reported and whether it is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No/ambiguous PMode, missing certificate information; never retried
    Configuration,
    /// Invalid packaging or policy non-compliance; never retried
    ProtocolViolation,
    /// Timeouts, connection failures, server errors; retryable
    TransientTransport,
    /// Signature or decryption failure; never retried
    Security,
    /// Failure not attributable to the request (ledger, pipeline bug, panic)
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientTransport)
    }

    /// Whether the failure was caused by the partner's request
    pub fn is_attributable_to_request(&self) -> bool {
        matches!(
            self,
            ErrorKind::Configuration | ErrorKind::ProtocolViolation | ErrorKind::Security
        )
    }
}

/// Failure description carried on a messaging context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub description: String,
}

impl ErrorResult {
    pub fn new(kind: ErrorKind, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            description: description.into(),
        }
    }

    /// Description safe to show to a trading partner
    ///
    /// Internal failures never leak their detail.
    pub fn partner_description(&self) -> String {
        match self.kind {
            ErrorKind::Internal => "Internal processing failure".to_string(),
            _ => self.description.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while resolving a PMode
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("No receiving PMode matches message {message_id}")]
    NoMatchingPMode { message_id: String },
    #[error("Message {message_id} matches {candidates:?} equally with score {score}")]
    AmbiguousPMode {
        message_id: String,
        candidates: Vec<String>,
        score: u32,
    },
    #[error("No sending PMode stored for referenced message {ref_to_message_id}")]
    NoSendingPMode { ref_to_message_id: String },
    #[error("Unknown PMode id {pmode_id}")]
    UnknownPModeId { pmode_id: String },
}

/// Errors raised by a ledger implementation
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Record {record_id} not found in {direction} ledger")]
    RecordNotFound { direction: Direction, record_id: RecordId },
    #[error("Illegal operation transition for {message_id}: {from} -> {to}")]
    IllegalTransition {
        message_id: String,
        from: String,
        to: String,
    },
    #[error("Datastore unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Stored PMode snapshot is corrupt: {0}")]
    CorruptSnapshot(#[from] serde_json::Error),
    #[error("Message body {location} not found")]
    BodyNotFound { location: String },
    #[error("Conflicting ledger write: {reason}")]
    Conflict { reason: String },
}

/// Errors raised by the transport or by deliver/notify targets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Network I/O error: {reason}")]
    Io { reason: String },
    #[error("TLS handshake failed: {reason}")]
    Tls { reason: String },
    #[error("Invalid transport configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. } | TransportError::Timeout { .. } | TransportError::Io { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for the message service handler
#[derive(Debug, thiserror::Error)]
pub enum MshError {
    #[error("PMode resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Invalid packaging or policy violation
    #[error("Protocol violation ({code:?}): {reason}")]
    ProtocolViolation { code: ErrorCode, reason: String },

    /// Signature verification or decryption failure
    #[error("Security failure ({code:?}): {reason}")]
    Security { code: ErrorCode, reason: String },

    /// Message content could not be decoded
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    /// Content type not supported by the codec
    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    /// Invocation was cancelled between blocking operations
    #[error("Processing cancelled")]
    Cancelled,

    /// Pipeline invariant broken (e.g. a step ran without its inputs)
    #[error("Pipeline error: {reason}")]
    Pipeline { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MshError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        MshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a protocol violation with an ebMS error code
    pub fn protocol_violation<T: Into<String>>(code: ErrorCode, reason: T) -> Self {
        MshError::ProtocolViolation {
            code,
            reason: reason.into(),
        }
    }

    /// Create a security failure with an ebMS error code
    pub fn security_failure<T: Into<String>>(code: ErrorCode, reason: T) -> Self {
        MshError::Security {
            code,
            reason: reason.into(),
        }
    }

    /// Create a pipeline invariant error
    pub fn pipeline_error<T: Into<String>>(reason: T) -> Self {
        MshError::Pipeline {
            reason: reason.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        MshError::Malformed {
            reason: reason.into(),
        }
    }

    /// Position of this error in the taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            MshError::Resolution(_) | MshError::Configuration { .. } => ErrorKind::Configuration,
            MshError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            MshError::Malformed { .. } | MshError::UnsupportedContentType { .. } => {
                ErrorKind::ProtocolViolation
            }
            MshError::Security { .. } => ErrorKind::Security,
            MshError::Transport(TransportError::Tls { .. })
            | MshError::Transport(TransportError::InvalidConfiguration { .. }) => ErrorKind::Configuration,
            MshError::Transport(_) => ErrorKind::TransientTransport,
            MshError::Ledger(_)
            | MshError::Serialization(_)
            | MshError::Cancelled
            | MshError::Pipeline { .. } => ErrorKind::Internal,
        }
    }

    /// ebMS error code reported to the partner for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MshError::Resolution(_) => ErrorCode::ProcessingModeMismatch,
            MshError::ProtocolViolation { code, .. } | MshError::Security { code, .. } => *code,
            MshError::Malformed { .. } => ErrorCode::InvalidHeader,
            MshError::UnsupportedContentType { .. } => ErrorCode::ValueNotRecognized,
            MshError::Configuration { .. } => ErrorCode::ProcessingModeMismatch,
            MshError::Transport(_) => ErrorCode::DeliveryFailure,
            _ => ErrorCode::Other,
        }
    }

    /// Convert into the failure description carried on a context
    pub fn to_error_result(&self) -> ErrorResult {
        ErrorResult::new(self.kind(), self.error_code(), self.to_string())
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MshError>;
pub type MshResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
