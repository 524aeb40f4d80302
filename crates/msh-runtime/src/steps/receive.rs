//! Receive pipeline steps
//!
//! Turn a raw inbound message into ledger records, answer it with receipts
//! or a pulled user message, and produce the HTTP response.

use async_trait::async_trait;
use hashbrown::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use msh_core::duplicates::{answer_status, classify_duplicates, initial_signal_operation, initial_user_operation};
use msh_core::errors::ErrorKind;
use msh_core::ledger::{RetryReliability, RetryOwner, RetryType};
use msh_core::message::{SignalMessage, UserMessage};
use msh_core::pmode::{resolve_signal_pmode, to_snapshot, ReplyPattern, SecurityRequirement};
use msh_core::{
    As4Message, Direction, ErrorCode, MessageRecord, MessageType, MessageUnit, MessagingContext, Mep, MshError,
    MshResult, Operation, ProcessingMode, PullSelection, ReceiveResponse, Status, Step, StepOutcome,
};

use super::{reply_pattern, sending_pmode_of, signal_handling};
use crate::services::Services;

// ----------------------------------------------------------------------------
// Deserialization
// ----------------------------------------------------------------------------

/// Decode the received body into the message model
pub struct DeserializeMessage {
    services: Arc<Services>,
}

impl DeserializeMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DeserializeMessage {
    fn name(&self) -> &'static str {
        "deserialize_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let received = context
            .received
            .as_ref()
            .ok_or_else(|| MshError::pipeline_error("Nothing was received"))?;

        if received.is_empty() {
            return Err(MshError::malformed("Empty message body"));
        }
        let limit = self.services.receive.max_message_size;
        if received.body.len() > limit {
            return Err(MshError::protocol_violation(
                ErrorCode::Other,
                format!("Message of {} bytes exceeds the limit of {} bytes", received.body.len(), limit),
            ));
        }
        if !self.services.codec.supports(&received.content_type) {
            return Err(MshError::UnsupportedContentType {
                content_type: received.content_type.clone(),
            });
        }

        let message = self
            .services
            .codec
            .deserialize(&received.content_type, &received.body)?;
        if message.is_empty() {
            return Err(MshError::malformed("Message carries no message units"));
        }

        debug!(
            message_id = ?message.primary_message_id(),
            units = message.message_units.len(),
            "Message decoded"
        );
        context.as4_message = Some(message);
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// PMode Determination
// ----------------------------------------------------------------------------

/// Bind the receiving PMode of user messages and the sending PMode answered by signals
pub struct DeterminePModes {
    services: Arc<Services>,
}

impl DeterminePModes {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DeterminePModes {
    fn name(&self) -> &'static str {
        "determine_pmodes"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let message = context.require_message()?.clone();

        if let Some(user) = message.first_user_message() {
            let candidates = self.services.pmodes.receiving_pmodes();
            let pmode = self.services.resolver.resolve(user, &candidates)?;
            context.receiving_pmode = Some(pmode);
        }

        if context.sending_pmode.is_none() {
            let answering = message.signal_messages().find(|s| answer_status(s).is_some());
            if let Some(signal) = answering {
                context.sending_pmode = resolve_signal_pmode(self.services.ledger.as_ref(), signal).await?;
            }
        }

        debug!(
            receiving = ?context.receiving_pmode.as_ref().map(|p| p.id.as_str()),
            sending = ?context.sending_pmode.as_ref().map(|p| p.id.as_str()),
            "PModes determined"
        );
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

/// Whether a security operation has to run, given the policy and the message
fn security_applies(requirement: SecurityRequirement, present: bool, what: &str) -> MshResult<bool> {
    match (requirement, present) {
        (SecurityRequirement::Ignored, _) => Ok(false),
        (SecurityRequirement::Required, false) => Err(MshError::security_failure(
            ErrorCode::PolicyNoncompliance,
            format!("Message must be {}", what),
        )),
        (SecurityRequirement::NotAllowed, true) => Err(MshError::security_failure(
            ErrorCode::PolicyNoncompliance,
            format!("Message must not be {}", what),
        )),
        (_, present) => Ok(present),
    }
}

pub struct VerifySignature {
    services: Arc<Services>,
}

impl VerifySignature {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for VerifySignature {
    fn name(&self) -> &'static str {
        "verify_signature"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let requirement = context
            .receiving_pmode
            .as_ref()
            .map(|p| p.security.signing_verification)
            .unwrap_or_default();
        let message = context.require_message()?;

        if security_applies(requirement, message.is_signed, "signed")? {
            self.services.security.verify(message).await?;
            debug!(message_id = ?message.primary_message_id(), "Signature verified");
        }
        Ok(StepOutcome::Continue)
    }
}

pub struct DecryptMessage {
    services: Arc<Services>,
}

impl DecryptMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DecryptMessage {
    fn name(&self) -> &'static str {
        "decrypt_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let (requirement, certificate_ref) = context
            .receiving_pmode
            .as_ref()
            .map(|p| (p.security.decryption, p.security.decryption_certificate_ref.clone()))
            .unwrap_or_default();
        let message = context.require_message()?;

        if security_applies(requirement, message.is_encrypted, "encrypted")? {
            let decrypted = self
                .services
                .security
                .decrypt(message.clone(), certificate_ref.as_deref())
                .await?;
            context.as4_message = Some(decrypted);
        }
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------------

fn invalid_header(reason: impl Into<String>) -> MshError {
    MshError::protocol_violation(ErrorCode::InvalidHeader, reason)
}

fn validate_user_message(user: &UserMessage) -> MshResult<()> {
    let id = &user.message_id;
    for (label, party) in [("From", &user.sender), ("To", &user.receiver)] {
        if party.party_ids.is_empty() || party.party_ids.iter().any(|p| p.id.is_empty()) {
            return Err(invalid_header(format!("{}: {} party has no PartyId", id, label)));
        }
        if party.role.is_empty() {
            return Err(invalid_header(format!("{}: {} party has no Role", id, label)));
        }
    }
    if user.collaboration.service.value.is_empty() {
        return Err(invalid_header(format!("{}: Service is missing", id)));
    }
    if user.collaboration.action.is_empty() {
        return Err(invalid_header(format!("{}: Action is missing", id)));
    }
    if user.mpc.is_empty() {
        return Err(invalid_header(format!("{}: MPC is empty", id)));
    }
    Ok(())
}

/// Structural checks on the decoded message
pub struct ValidateMessage;

#[async_trait]
impl Step for ValidateMessage {
    fn name(&self) -> &'static str {
        "validate_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let message = context.require_message()?;

        let mut seen = HashSet::new();
        for unit in &message.message_units {
            let id = unit.message_id();
            if id.is_empty() {
                return Err(invalid_header("Message unit without MessageId"));
            }
            if !seen.insert(id) {
                return Err(MshError::protocol_violation(
                    ErrorCode::ValueInconsistent,
                    format!("MessageId {} is used by more than one message unit", id),
                ));
            }

            match unit {
                MessageUnit::User(user) => validate_user_message(user)?,
                MessageUnit::Signal(SignalMessage::Receipt(receipt)) if receipt.ref_to_message_id.is_empty() => {
                    return Err(invalid_header(format!("Receipt {} has no RefToMessageId", id)));
                }
                MessageUnit::Signal(SignalMessage::PullRequest(pr)) if pr.mpc.is_empty() => {
                    return Err(invalid_header(format!("PullRequest {} has no MPC", id)));
                }
                MessageUnit::Signal(_) => {}
            }
        }

        if message.pull_request().is_some() && message.user_messages().next().is_some() {
            return Err(MshError::protocol_violation(
                ErrorCode::ValueInconsistent,
                "A PullRequest cannot be bundled with user messages",
            ));
        }
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

/// Classify duplicates and record every received message unit
pub struct StoreReceivedMessage {
    services: Arc<Services>,
}

impl StoreReceivedMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn store_user_message(
        &self,
        context: &mut MessagingContext,
        user: &UserMessage,
        location: Option<String>,
    ) -> MshResult<()> {
        let ledger = self.services.ledger.as_ref();
        let pmode = context
            .receiving_pmode
            .clone()
            .ok_or_else(|| MshError::pipeline_error("User message stored without a receiving PMode"))?;
        let is_duplicate = context.is_duplicate(&user.message_id);
        let operation = initial_user_operation(user, &pmode, is_duplicate);

        let mut record = MessageRecord::for_unit(
            Direction::In,
            &MessageUnit::User(user.clone()),
            self.services.time_source.now(),
        )
        .with_operation(operation)
        .with_mep(pmode.mep)
        .with_pmode(pmode.id.clone(), to_snapshot(pmode.as_ref())?);
        record.is_duplicate = is_duplicate;
        record.message_location = location;

        let inserted = ledger.insert(record).await?;
        if inserted.is_duplicate && !is_duplicate {
            info!(message_id = %user.message_id, "Concurrent original won, stored as duplicate");
            context.duplicates.insert(user.message_id.clone(), true);
        }

        let delivering = !inserted.is_duplicate && operation == Operation::ToBeDelivered;
        if delivering && pmode.deliver.reliability.is_enabled {
            let rr = RetryReliability::from_config(
                RetryOwner::InMessage(inserted.record_id),
                RetryType::Delivery,
                &pmode.deliver.reliability,
            );
            ledger.insert_retry_reliability(rr).await?;
        }
        Ok(())
    }

    async fn store_signal(
        &self,
        context: &MessagingContext,
        signal: &SignalMessage,
        location: Option<String>,
    ) -> MshResult<()> {
        let ledger = self.services.ledger.as_ref();
        let now = self.services.time_source.now();
        let unit = MessageUnit::Signal(signal.clone());

        if let SignalMessage::PullRequest(_) = signal {
            let mut record = MessageRecord::for_unit(Direction::In, &unit, now);
            record.message_location = location;
            ledger.insert(record).await?;
            return Ok(());
        }

        let is_duplicate = signal
            .ref_to_message_id()
            .map_or(false, |ref_to| context.is_duplicate(ref_to));
        let pmode = match resolve_signal_pmode(ledger, signal).await {
            Ok(Some(pmode)) => Some(pmode),
            Ok(None) => context.sending_pmode.clone(),
            Err(e) => {
                warn!(signal = signal.message_id(), error = %e, "No PMode for signal, using the message's PMode");
                context.sending_pmode.clone()
            }
        };
        let operation = initial_signal_operation(signal, pmode.as_deref(), is_duplicate);

        let mut record = MessageRecord::for_unit(Direction::In, &unit, now).with_operation(operation);
        if let Some(pmode) = &pmode {
            record = record.with_pmode(pmode.id.clone(), to_snapshot(pmode.as_ref())?);
        }
        record.is_duplicate = is_duplicate;
        record.message_location = location;
        let inserted = ledger.insert(record).await?;

        if let (Some(status), Some(ref_to)) = (answer_status(signal), signal.ref_to_message_id()) {
            let answered = ledger
                .update_by_message_id(Direction::Out, ref_to, &mut |out| out.status = status)
                .await?;
            debug!(ref_to, ?status, answered, "Outbound message answered");
        }

        // A concurrent original makes the ledger store this one as an idle duplicate
        if operation == Operation::ToBeNotified && !inserted.is_duplicate {
            let handling = pmode.as_deref().and_then(|p| signal_handling(signal, p));
            if let Some(handling) = handling.filter(|h| h.reliability.is_enabled) {
                let rr = RetryReliability::from_config(
                    RetryOwner::InMessage(inserted.record_id),
                    RetryType::Notification,
                    &handling.reliability,
                );
                ledger.insert_retry_reliability(rr).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StoreReceivedMessage {
    fn name(&self) -> &'static str {
        "store_received_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let message = context.require_message()?.clone();
        context.duplicates = classify_duplicates(self.services.ledger.as_ref(), &message).await?;

        let location = match (self.services.receive.store_bodies, message.primary_message_id()) {
            (true, Some(id)) => Some(self.services.store_body(id, &message).await?),
            _ => None,
        };

        for unit in &message.message_units {
            match unit {
                MessageUnit::User(user) => self.store_user_message(context, user, location.clone()).await?,
                MessageUnit::Signal(signal) => self.store_signal(context, signal, location.clone()).await?,
            }
        }

        info!(
            message_id = ?message.primary_message_id(),
            units = message.message_units.len(),
            duplicates = context.duplicates.values().filter(|d| **d).count(),
            mode = ?context.mode,
            "Received message stored"
        );
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Answers
// ----------------------------------------------------------------------------

/// Answer a received PullRequest with the oldest waiting user message
pub struct SelectPullResponse {
    services: Arc<Services>,
}

impl SelectPullResponse {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SelectPullResponse {
    fn name(&self) -> &'static str {
        "select_pull_response"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        if context.mode != ProcessingMode::Receive {
            return Ok(StepOutcome::Continue);
        }
        let pull_request = match context.require_message()?.pull_request() {
            Some(pr) => pr.clone(),
            None => return Ok(StepOutcome::Continue),
        };

        match self.services.pull.select_user_message(&pull_request.mpc).await? {
            PullSelection::Selected { record, message } => {
                info!(
                    mpc = %pull_request.mpc,
                    message_id = %record.ebms_message_id,
                    "Answering PullRequest with user message"
                );
                context.sending_pmode = sending_pmode_of(&record)?;
                context.out_record = Some(record.record_id);
                context.reply = Some(message);
            }
            PullSelection::Empty => {
                debug!(mpc = %pull_request.mpc, "Answering PullRequest with empty MPC warning");
                let warning = SignalMessage::pull_request_error(&pull_request, self.services.time_source.now());
                context.reply = Some(As4Message::from_signal(warning));
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Acknowledge every received user message
pub struct CreateReceipts {
    services: Arc<Services>,
}

impl CreateReceipts {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for CreateReceipts {
    fn name(&self) -> &'static str {
        "create_receipts"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        if context.mode == ProcessingMode::Send || context.receiving_pmode.is_none() {
            return Ok(StepOutcome::Continue);
        }
        let now = self.services.time_source.now();
        let receipts: Vec<SignalMessage> = context
            .require_message()?
            .user_messages()
            .map(|user| SignalMessage::receipt_for(user, now))
            .collect();
        if receipts.is_empty() {
            return Ok(StepOutcome::Continue);
        }

        let reply = context.reply.get_or_insert_with(As4Message::empty);
        for receipt in receipts {
            reply.add_unit(MessageUnit::Signal(receipt));
        }
        Ok(StepOutcome::Continue)
    }
}

/// Record the receipts and errors we answer with as OutMessages
///
/// Where a signal goes next depends on the reply pattern: answered on the
/// HTTP response it is already sent, a callback is pushed by the send agent,
/// a piggybacked signal waits for the next PullRequest.
pub struct StoreOutboundSignals {
    services: Arc<Services>,
}

impl StoreOutboundSignals {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for StoreOutboundSignals {
    fn name(&self) -> &'static str {
        "store_outbound_signals"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let signals: Vec<SignalMessage> = match &context.reply {
            Some(reply) => reply
                .signal_messages()
                .filter(|signal| answer_status(signal).is_some())
                .cloned()
                .collect(),
            None => return Ok(StepOutcome::Continue),
        };
        if signals.is_empty() {
            return Ok(StepOutcome::Continue);
        }

        let pattern = reply_pattern(context);
        let callback_pmode = match pattern {
            ReplyPattern::Callback => {
                let id = context
                    .receiving_pmode
                    .as_ref()
                    .and_then(|p| p.reply_handling.sending_pmode_id.as_deref())
                    .ok_or_else(|| MshError::config_error("Callback reply pattern without a sending PMode"))?;
                Some(self.services.pmodes.require_sending_pmode(id)?)
            }
            _ => None,
        };
        // Errors answered in-line are reported to the business application on request
        let error_notification = context
            .receiving_pmode
            .clone()
            .filter(|p| p.reply_handling.error_handling.notify_message_producer);
        let piggyback_url = match context.mode {
            ProcessingMode::PullReceive => context
                .sending_pmode
                .as_ref()
                .and_then(|p| p.push_url())
                .map(str::to_string),
            _ => None,
        };

        let ledger = self.services.ledger.as_ref();
        let now = self.services.time_source.now();
        for signal in signals {
            let single = As4Message::from_signal(signal.clone());
            let location = self.services.store_body(signal.message_id(), &single).await?;

            let unit = MessageUnit::Signal(signal);
            let mut record = MessageRecord::for_unit(Direction::Out, &unit, now);
            record.message_location = Some(location);
            let notify_pmode = error_notification
                .as_ref()
                .filter(|_| pattern == ReplyPattern::Response && record.message_type == MessageType::Error);
            record = match (&pattern, &callback_pmode) {
                (ReplyPattern::Callback, Some(pmode)) => record
                    .with_operation(Operation::ToBeSent)
                    .with_mep(pmode.mep)
                    .with_url(pmode.push_url().map(str::to_string))
                    .with_pmode(pmode.id.clone(), to_snapshot(pmode.as_ref())?),
                (ReplyPattern::PiggyBack, _) => record
                    .with_operation(Operation::ToBePiggyBacked)
                    .with_mep(Mep::Pull)
                    .with_url(piggyback_url.clone()),
                _ => {
                    record.status = Status::Sent;
                    match notify_pmode {
                        Some(pmode) => record
                            .with_operation(Operation::ToBeNotified)
                            .with_pmode(pmode.id.clone(), to_snapshot(pmode.as_ref())?),
                        None => record.with_operation(Operation::Sent),
                    }
                }
            };

            let inserted = ledger.insert(record).await?;
            if inserted.is_duplicate {
                continue;
            }
            if let Some(pmode) = notify_pmode {
                let reliability = &pmode.reply_handling.error_handling.reliability;
                if reliability.is_enabled {
                    let rr = RetryReliability::from_config(
                        RetryOwner::OutMessage(inserted.record_id),
                        RetryType::Notification,
                        reliability,
                    );
                    ledger.insert_retry_reliability(rr).await?;
                }
                debug!(record = %inserted.record_id, "Outbound error queued for notification");
            }
            if let Some(pmode) = callback_pmode.as_ref().filter(|p| p.reliability.retry.is_enabled) {
                let rr = RetryReliability::from_config(
                    RetryOwner::OutMessage(inserted.record_id),
                    RetryType::Delivery,
                    &pmode.reliability.retry,
                );
                ledger.insert_retry_reliability(rr).await?;
            }
        }

        debug!(?pattern, "Outbound signals stored");
        Ok(StepOutcome::Continue)
    }
}

/// Sign and encrypt a pulled user message like any pushed one
pub struct SecurePullResponse {
    services: Arc<Services>,
}

impl SecurePullResponse {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn secure(&self, context: &MessagingContext, message: As4Message) -> MshResult<As4Message> {
        let pmode = super::require_sending_pmode(context)?;
        let security = &pmode.security;
        let mut message = message;
        if security.signing.is_enabled {
            message = self
                .services
                .security
                .sign(message, security.signing.certificate_ref.as_deref())
                .await?;
        }
        if security.encryption.is_enabled {
            message = self
                .services
                .security
                .encrypt(message, security.encryption.public_key_ref.as_deref())
                .await?;
        }
        Ok(message)
    }
}

#[async_trait]
impl Step for SecurePullResponse {
    fn name(&self) -> &'static str {
        "secure_pull_response"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let record_id = match (context.mode, context.out_record) {
            (ProcessingMode::Receive, Some(record_id)) => record_id,
            _ => return Ok(StepOutcome::Continue),
        };
        let reply = match context.reply.clone() {
            Some(reply) if reply.is_user_message() => reply,
            _ => return Ok(StepOutcome::Continue),
        };

        match self.secure(context, reply).await {
            Ok(secured) => {
                context.reply = Some(secured);
                Ok(StepOutcome::Continue)
            }
            Err(e) => {
                // Put the message back so the next PullRequest can take it
                let ledger = self.services.ledger.as_ref();
                let released = ledger
                    .try_transition(Direction::Out, record_id, &[Operation::Sent], Operation::ToBeSent)
                    .await?;
                if released {
                    ledger
                        .update_record(Direction::Out, record_id, &mut |r| r.status = Status::Created)
                        .await?;
                }
                context.out_record = None;
                warn!(record = %record_id, error = %e, released, "Pulled message could not be secured");
                Err(e)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Response
// ----------------------------------------------------------------------------

/// Whether the reply travels on the HTTP response
fn is_synchronous(context: &MessagingContext, reply: &As4Message) -> bool {
    if reply.is_user_message() {
        return true;
    }
    let pull_warning = reply
        .signal_messages()
        .any(|s| matches!(s, SignalMessage::Error(e) if e.is_pull_request_warning()));
    pull_warning || reply_pattern(context) == ReplyPattern::Response
}

/// Map the processing outcome onto an HTTP response
pub struct Respond {
    services: Arc<Services>,
}

impl Respond {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn failure_status(context: &MessagingContext) -> u16 {
        match &context.error_result {
            Some(error) if error.kind == ErrorKind::Internal => 500,
            Some(error) if context.as4_message.is_none() => {
                if error.code == ErrorCode::ValueNotRecognized {
                    415
                } else {
                    400
                }
            }
            _ => 200,
        }
    }
}

#[async_trait]
impl Step for Respond {
    fn name(&self) -> &'static str {
        "respond"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        if context.mode == ProcessingMode::PullReceive {
            context.response = Some(ReceiveResponse::accepted());
            return Ok(StepOutcome::Continue);
        }

        // Failures the partner cannot correlate are always answered in-line
        let in_line_failure = context.has_failed() && Self::failure_status(context) != 200;
        let synchronous = context
            .reply
            .as_ref()
            .filter(|reply| !reply.is_empty() && (in_line_failure || is_synchronous(context, reply)));
        let encoded = match synchronous {
            Some(reply) => Some(self.services.codec.serialize(reply)?),
            None => None,
        };

        let response = match (context.has_failed(), encoded) {
            (false, Some(encoded)) => ReceiveResponse::ok(encoded.content_type, encoded.body),
            (false, None) => ReceiveResponse::accepted(),
            (true, Some(encoded)) => ReceiveResponse::failure(
                Self::failure_status(context),
                Some(encoded.content_type),
                encoded.body,
            ),
            (true, None) => match Self::failure_status(context) {
                200 => ReceiveResponse::accepted(),
                status => ReceiveResponse::failure(status, None, Vec::new()),
            },
        };

        debug!(status = response.status_code, "Response prepared");
        context.response = Some(response);
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
