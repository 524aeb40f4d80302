//! Message Service Handler facade
//!
//! Entry points exposed to the HTTP layer and to the agents: receive a
//! message, send one, submit one for sending, and run the reliability sweeps.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use msh_core::message::{ErrorCode, SignalMessage, UserMessage};
use msh_core::pmode::to_snapshot;
use msh_core::reliability::{RetrySweepReport, SendCallbacks};
use msh_core::{
    As4Message, Direction, ErrorResult, MessageRecord, MessageUnit, MessagingContext, Mep, MshError, MshResult,
    Operation, Pipeline, ReceiveResponse, ReceivedMessage, RecordId, RetryOwner, RetryReliability, RetryType,
    SendResult, SweepReport,
};

use crate::pipelines::{receive_error_pipeline, receive_pipeline, send_pipeline};
use crate::services::Services;

// ----------------------------------------------------------------------------
// Send Outcome
// ----------------------------------------------------------------------------

/// What happened to one send invocation
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: Option<String>,
    /// Verdict of the HTTP exchange; `None` when the message never left
    pub send_result: Option<SendResult>,
    pub error: Option<ErrorResult>,
    /// Message received synchronously in answer, after it went through the receive pipeline
    pub reply: Option<As4Message>,
    /// Failure processing the synchronous answer
    pub reply_error: Option<ErrorResult>,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        self.send_result.map_or(false, |r| r.is_success()) && self.error.is_none()
    }

    /// Whether a PullRequest was answered with a user message
    pub fn pulled_user_message(&self) -> bool {
        self.reply.as_ref().map_or(false, As4Message::is_user_message)
    }
}

// ----------------------------------------------------------------------------
// Message Service Handler
// ----------------------------------------------------------------------------

pub struct Msh {
    services: Arc<Services>,
    receive: Pipeline,
    receive_error: Pipeline,
    send: Pipeline,
}

impl Msh {
    pub fn new(services: Services) -> Self {
        let services = Arc::new(services);
        Self {
            receive: receive_pipeline(&services),
            receive_error: receive_error_pipeline(&services),
            send: send_pipeline(&services),
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Process a message pushed to this MSH and produce the HTTP answer
    pub async fn run_receive_pipeline(&self, received: ReceivedMessage) -> ReceiveResponse {
        let context = self.process_received(MessagingContext::for_receive(received)).await;
        match context.response {
            Some(response) => response,
            None => self.generic_failure(),
        }
    }

    /// Run the receive pipeline, falling back to the error path
    async fn process_received(&self, context: MessagingContext) -> MessagingContext {
        let result = self.receive.run(context).await;
        if result.succeeded {
            return result.context;
        }

        let result = self.receive_error.run(result.context).await;
        let mut context = result.context;
        if !result.succeeded {
            error!(
                error = ?context.error_result.as_ref().map(|e| &e.description),
                "Receive error path failed"
            );
            context.response = Some(self.generic_failure());
        }
        context
    }

    /// Error signal for failures nothing else can describe
    fn generic_failure(&self) -> ReceiveResponse {
        let signal = SignalMessage::error_for(
            None,
            ErrorCode::Other,
            "Internal processing failure",
            self.services.time_source.now(),
        );
        match self.services.codec.serialize(&As4Message::from_signal(signal)) {
            Ok(encoded) => ReceiveResponse::failure(500, Some(encoded.content_type), encoded.body),
            Err(e) => {
                error!(error = %e, "Cannot encode generic error signal");
                ReceiveResponse::failure(500, None, Vec::new())
            }
        }
    }

    /// Send an outbound message and process the synchronous answer, if any
    pub async fn run_send_pipeline(&self, context: MessagingContext) -> SendOutcome {
        let message_id = context
            .as4_message
            .as_ref()
            .and_then(|m| m.primary_message_id())
            .map(str::to_string);
        let is_pull_request = context.as4_message.as_ref().map_or(false, As4Message::is_pull_request);

        let result = self.send.run(context).await;
        let mut context = result.context;

        if !result.succeeded && context.send_result.is_none() {
            if let Err(e) = self.abandon_send(&context).await {
                error!(message_id = ?message_id, error = %e, "Could not settle abandoned send");
            }
        }

        let mut outcome = SendOutcome {
            message_id,
            send_result: context.send_result,
            error: context.error_result.clone(),
            reply: None,
            reply_error: None,
        };

        if let Some(received) = context.transport_response.take() {
            let pmode = context.sending_pmode.clone();
            let answer = if is_pull_request {
                MessagingContext::for_pull_receive(received, pmode)
            } else {
                MessagingContext::for_send_response(received, pmode)
            };
            // An answer that arrived is processed even if the send was cancelled meanwhile
            let answered = self.process_received(answer).await;
            outcome.reply = answered.as4_message;
            outcome.reply_error = answered.error_result;
        }
        outcome
    }

    /// Settle the ledger for a send that failed before reaching the partner
    async fn abandon_send(&self, context: &MessagingContext) -> MshResult<()> {
        if context.as4_message.as_ref().map_or(false, As4Message::is_pull_request) {
            return self.services.pull.complete_bundle(&context.bundled, false).await;
        }
        let record_id = match context.out_record {
            Some(record_id) => record_id,
            None => return Ok(()),
        };

        if context.is_cancelled() {
            let released = self
                .services
                .ledger
                .try_transition(Direction::Out, record_id, &[Operation::Sending], Operation::ToBeSent)
                .await?;
            info!(record = %record_id, released, "Send cancelled, claim released");
            return Ok(());
        }

        warn!(
            record = %record_id,
            error = ?context.error_result.as_ref().map(|e| &e.description),
            "Message cannot be sent"
        );
        let callbacks = SendCallbacks::new(context.sending_pmode.clone(), self.services.time_source.clone());
        self.services
            .retry
            .handle(RetryOwner::OutMessage(record_id), SendResult::FatalFail, &callbacks)
            .await?;
        Ok(())
    }

    /// Store a user message for sending under the given sending PMode
    pub async fn submit(&self, user_message: UserMessage, pmode_id: &str) -> MshResult<RecordId> {
        let services = &self.services;
        let pmode = services.pmodes.require_sending_pmode(pmode_id)?;
        let ledger = services.ledger.as_ref();

        if !ledger
            .find_by_message_id(Direction::Out, &user_message.message_id)
            .await?
            .is_empty()
        {
            return Err(MshError::protocol_violation(
                ErrorCode::ValueInconsistent,
                format!("Message {} was already submitted", user_message.message_id),
            ));
        }

        let mut user = user_message;
        let packaging = &pmode.message_packaging;
        if let Some(mpc) = &packaging.mpc {
            user.mpc = mpc.clone();
        }
        if user.sender.is_empty() {
            if let Some(from) = &packaging.party_info.from {
                user.sender = from.clone();
            }
        }
        if user.receiver.is_empty() {
            if let Some(to) = &packaging.party_info.to {
                user.receiver = to.clone();
            }
        }

        let message = As4Message::from_user_message(user);
        let unit: &MessageUnit = message
            .primary_unit()
            .ok_or_else(|| MshError::pipeline_error("Submitted message has no unit"))?;
        let location = services.store_body(unit.message_id(), &message).await?;

        let mut record = MessageRecord::for_unit(Direction::Out, unit, services.time_source.now())
            .with_operation(Operation::ToBeSent)
            .with_mep(pmode.mep)
            .with_url(pmode.push_url().map(str::to_string))
            .with_pmode(pmode.id.clone(), to_snapshot(pmode.as_ref())?);
        record.message_location = Some(location);
        let inserted = ledger.insert(record).await?;

        let retry = &pmode.reliability.retry;
        if pmode.mep == Mep::Push && !pmode.reception_awareness_enabled() && retry.is_enabled {
            let rr = RetryReliability::from_config(RetryOwner::OutMessage(inserted.record_id), RetryType::Delivery, retry);
            ledger.insert_retry_reliability(rr).await?;
        }

        info!(
            message_id = %unit.message_id(),
            pmode = %pmode.id,
            mep = ?pmode.mep,
            record = %inserted.record_id,
            "User message submitted"
        );
        Ok(inserted.record_id)
    }

    /// Resend or dead-letter unanswered user messages
    pub async fn sweep_reception_awareness(&self) -> MshResult<SweepReport> {
        self.services.awareness.sweep().await
    }

    /// Requeue owners whose backoff elapsed
    pub async fn sweep_retries(&self) -> MshResult<RetrySweepReport> {
        let report = self.services.retry.sweep().await?;
        if report.requeued > 0 {
            debug!(?report, "Retry sweep finished");
        }
        Ok(report)
    }
}
