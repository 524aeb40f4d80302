//! Messaging context
//!
//! The unit of work that flows through a pipeline. A context is owned by a
//! single pipeline invocation and is never shared between tasks.

use hashbrown::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorResult, MshError};
use crate::message::{As4Message, SignalMessage, UserMessage};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::send_result::SendResult;
use crate::types::{ProcessingMode, RecordId};

// ----------------------------------------------------------------------------
// Boundary Types
// ----------------------------------------------------------------------------

/// Raw message as it crossed the HTTP boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ReceivedMessage {
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            body,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// What the receive boundary hands back to the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResponse {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ReceiveResponse {
    /// 202: accepted, signals (if any) travel asynchronously
    pub fn accepted() -> Self {
        Self {
            status_code: 202,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// 200 with a serialized signal message
    pub fn ok(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status_code: 200,
            content_type: Some(content_type.into()),
            body,
        }
    }

    /// 4xx/5xx, optionally carrying a serialized Error signal
    pub fn failure(status_code: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status_code,
            content_type,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

// ----------------------------------------------------------------------------
// Messaging Context
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MessagingContext {
    pub mode: ProcessingMode,
    pub received: Option<ReceivedMessage>,
    /// Replaced wholesale by deserialization, build and selection steps
    pub as4_message: Option<As4Message>,
    pub sending_pmode: Option<Arc<SendingPMode>>,
    pub receiving_pmode: Option<Arc<ReceivingPMode>>,
    pub error_result: Option<ErrorResult>,
    /// Ledger record being sent
    pub out_record: Option<RecordId>,
    /// ebMS id (user messages) or RefToMessageId (signals) -> is duplicate
    pub duplicates: HashMap<String, bool>,
    /// Signals, or the pulled user message, produced in answer to the received message
    pub reply: Option<As4Message>,
    /// OutMessage signals piggybacked onto the PullRequest being sent
    pub bundled: Vec<RecordId>,
    pub response: Option<ReceiveResponse>,
    /// Synchronous reply captured by the send step
    pub transport_response: Option<ReceivedMessage>,
    pub send_result: Option<SendResult>,
    pub cancellation: CancellationToken,
    pub stop_execution: bool,
}

impl MessagingContext {
    fn new(mode: ProcessingMode) -> Self {
        Self {
            mode,
            received: None,
            as4_message: None,
            sending_pmode: None,
            receiving_pmode: None,
            error_result: None,
            out_record: None,
            duplicates: HashMap::new(),
            reply: None,
            bundled: Vec::new(),
            response: None,
            transport_response: None,
            send_result: None,
            cancellation: CancellationToken::new(),
            stop_execution: false,
        }
    }

    /// Context for a message pushed to this MSH
    pub fn for_receive(received: ReceivedMessage) -> Self {
        let mut context = Self::new(ProcessingMode::Receive);
        context.received = Some(received);
        context
    }

    /// Context for the synchronous answer to one of our own PullRequests
    pub fn for_pull_receive(received: ReceivedMessage, sending_pmode: Option<Arc<SendingPMode>>) -> Self {
        let mut context = Self::new(ProcessingMode::PullReceive);
        context.received = Some(received);
        context.sending_pmode = sending_pmode;
        context
    }

    /// Context for the synchronous reply to a pushed message
    pub fn for_send_response(received: ReceivedMessage, sending_pmode: Option<Arc<SendingPMode>>) -> Self {
        let mut context = Self::for_receive(received);
        context.sending_pmode = sending_pmode;
        context
    }

    /// Context for an outbound message
    pub fn for_send(
        as4_message: As4Message,
        sending_pmode: Arc<SendingPMode>,
        out_record: Option<RecordId>,
    ) -> Self {
        let mut context = Self::new(ProcessingMode::Send);
        context.as4_message = Some(as4_message);
        context.sending_pmode = Some(sending_pmode);
        context.out_record = out_record;
        context
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Record a failure; the first failure wins
    pub fn fail_with(&mut self, error: &MshError) {
        if self.error_result.is_none() {
            self.error_result = Some(error.to_error_result());
        }
    }

    pub fn has_failed(&self) -> bool {
        self.error_result.is_some()
    }

    pub fn first_user_message(&self) -> Option<&UserMessage> {
        self.as4_message.as_ref().and_then(As4Message::first_user_message)
    }

    pub fn signal_messages(&self) -> Vec<&SignalMessage> {
        self.as4_message
            .as_ref()
            .map(|message| message.signal_messages().collect())
            .unwrap_or_default()
    }

    /// Message that is required past deserialization
    pub fn require_message(&self) -> Result<&As4Message, MshError> {
        self.as4_message
            .as_ref()
            .ok_or_else(|| MshError::pipeline_error("Step ran before a message was available"))
    }

    pub fn is_duplicate(&self, id: &str) -> bool {
        self.duplicates.get(id).copied().unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Step Result
// ----------------------------------------------------------------------------

/// Outcome of a full pipeline run; immutable once returned
#[derive(Debug)]
pub struct StepResult {
    pub context: MessagingContext,
    pub succeeded: bool,
    pub stop_execution: bool,
}

impl StepResult {
    pub fn success(context: MessagingContext) -> Self {
        Self {
            context,
            succeeded: true,
            stop_execution: false,
        }
    }

    pub fn success_and_stop(context: MessagingContext) -> Self {
        Self {
            context,
            succeeded: true,
            stop_execution: true,
        }
    }

    pub fn failed(context: MessagingContext) -> Self {
        Self {
            context,
            succeeded: false,
            stop_execution: true,
        }
    }
}
