//! Send pipeline steps

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use msh_core::errors::TransportError;
use msh_core::pmode::SendingPMode;
use msh_core::reliability::retry::SendCallbacks;
use msh_core::send_result::classify;
use msh_core::{
    Direction, ErrorCode, MessagingContext, MshError, MshResult, Operation, ReceivedMessage, RetryOwner, SendResult,
    Step, StepOutcome, TransportOutcome, TransportRequest,
};

use super::require_sending_pmode;
use crate::services::Services;

// ----------------------------------------------------------------------------
// PMode Completion
// ----------------------------------------------------------------------------

/// Complete the sending PMode through an SMP lookup
///
/// The configured PMode is never modified; the completed copy only lives on
/// this context, and the discovered url is recorded on the OutMessage.
pub struct DynamicDiscoveryStep {
    services: Arc<Services>,
}

impl DynamicDiscoveryStep {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DynamicDiscoveryStep {
    fn name(&self) -> &'static str {
        "dynamic_discovery"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let pmode = require_sending_pmode(context)?;
        let config = match &pmode.dynamic_discovery {
            Some(config) => config,
            None => return Ok(StepOutcome::Continue),
        };
        let discovery = self.services.discovery.as_ref().ok_or_else(|| {
            MshError::config_error(format!(
                "PMode {} uses dynamic discovery but no discovery client is configured",
                pmode.id
            ))
        })?;

        let fragment = discovery.discover(&pmode, config).await?;
        let completed = Arc::new(pmode.with_discovered(&fragment));

        if let Some(record_id) = context.out_record {
            let url = completed.push_url().map(str::to_string);
            self.services
                .ledger
                .update_record(Direction::Out, record_id, &mut |record| record.url = url.clone())
                .await?;
        }
        info!(
            pmode = %pmode.id,
            url = ?completed.push_url(),
            profile = %config.smp_profile,
            "Sending PMode completed by dynamic discovery"
        );
        context.sending_pmode = Some(completed);
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Packaging
// ----------------------------------------------------------------------------

/// Piggyback waiting receipts and errors onto an outgoing PullRequest
pub struct BundlePullSignals {
    services: Arc<Services>,
}

impl BundlePullSignals {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for BundlePullSignals {
    fn name(&self) -> &'static str {
        "bundle_pull_signals"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let pmode = require_sending_pmode(context)?;
        let message = match context.as4_message.as_mut() {
            Some(message) if message.is_pull_request() => message,
            _ => return Ok(StepOutcome::Continue),
        };
        context.bundled = self.services.pull.bundle(message, &pmode).await?;
        Ok(StepOutcome::Continue)
    }
}

pub struct SignMessage {
    services: Arc<Services>,
}

impl SignMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SignMessage {
    fn name(&self) -> &'static str {
        "sign_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let pmode = require_sending_pmode(context)?;
        let signing = &pmode.security.signing;
        if !signing.is_enabled {
            return Ok(StepOutcome::Continue);
        }
        let message = context.require_message()?.clone();
        let signed = self
            .services
            .security
            .sign(message, signing.certificate_ref.as_deref())
            .await?;
        context.as4_message = Some(signed);
        Ok(StepOutcome::Continue)
    }
}

/// Encrypt outbound user messages; signals travel unencrypted
pub struct EncryptMessage {
    services: Arc<Services>,
}

impl EncryptMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for EncryptMessage {
    fn name(&self) -> &'static str {
        "encrypt_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let pmode = require_sending_pmode(context)?;
        let encryption = &pmode.security.encryption;
        let message = context.require_message()?;
        if !encryption.is_enabled || !message.is_user_message() {
            return Ok(StepOutcome::Continue);
        }
        let encrypted = self
            .services
            .security
            .encrypt(message.clone(), encryption.public_key_ref.as_deref())
            .await?;
        context.as4_message = Some(encrypted);
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Transmission
// ----------------------------------------------------------------------------

/// Error describing a failed attempt, for the context and the logs
fn attempt_error(outcome: &TransportOutcome, verdict: SendResult) -> MshError {
    match outcome {
        TransportOutcome::Failed(error) => MshError::Transport(error.clone()),
        TransportOutcome::Response { status, .. } if verdict == SendResult::RetryableFail => {
            MshError::Transport(TransportError::Io {
                reason: format!("HTTP {}", status),
            })
        }
        TransportOutcome::Response { status, content_type, .. } => MshError::protocol_violation(
            ErrorCode::DeliveryFailure,
            format!("Partner answered HTTP {} ({:?})", status, content_type),
        ),
    }
}

fn client_certificate_ref(pmode: &SendingPMode) -> Option<String> {
    pmode
        .push_configuration
        .as_ref()
        .filter(|push| push.tls.is_enabled)
        .and_then(|push| push.tls.client_certificate_ref.clone())
}

/// POST the message, classify the outcome and settle the ledger
pub struct SendMessage {
    services: Arc<Services>,
}

impl SendMessage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Apply the verdict to the records involved in this send
    async fn settle(&self, context: &MessagingContext, pmode: &Arc<SendingPMode>, verdict: SendResult) -> MshResult<()> {
        let message = context.require_message()?;
        if message.is_pull_request() {
            return self.services.pull.complete_bundle(&context.bundled, verdict.is_success()).await;
        }
        let record_id = match context.out_record {
            Some(record_id) => record_id,
            None => return Ok(()),
        };
        let ledger = self.services.ledger.as_ref();
        let callbacks = SendCallbacks::new(Some(pmode.clone()), self.services.time_source.clone());

        if message.is_user_message() && pmode.reception_awareness_enabled() {
            let message_id = message.primary_message_id().unwrap_or_default();
            self.services
                .awareness
                .record_send_attempt(record_id, message_id, pmode)
                .await?;

            match verdict {
                SendResult::Success => {
                    ledger
                        .update_record(Direction::Out, record_id, &mut |record| {
                            record.operation = Operation::Sent;
                            if !record.status.is_answered() {
                                record.status = msh_core::Status::Sent;
                            }
                        })
                        .await?;
                }
                // The awareness sweep schedules the resend
                SendResult::RetryableFail => {
                    ledger
                        .try_transition(Direction::Out, record_id, &[Operation::Sending], Operation::ToBeRetried)
                        .await?;
                }
                SendResult::FatalFail => {
                    self.services
                        .retry
                        .handle(RetryOwner::OutMessage(record_id), verdict, &callbacks)
                        .await?;
                }
            }
            return Ok(());
        }

        self.services
            .retry
            .handle(RetryOwner::OutMessage(record_id), verdict, &callbacks)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Step for SendMessage {
    fn name(&self) -> &'static str {
        "send_message"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let pmode = require_sending_pmode(context)?;
        let url = pmode
            .push_url()
            .ok_or_else(|| MshError::config_error(format!("PMode {} has no push url", pmode.id)))?
            .to_string();
        let encoded = self.services.codec.serialize(context.require_message()?)?;

        if context.is_cancelled() {
            return Err(MshError::Cancelled);
        }

        let message_id = context
            .require_message()?
            .primary_message_id()
            .unwrap_or_default()
            .to_string();
        debug!(message_id = %message_id, url = %url, bytes = encoded.body.len(), "Sending message");

        let outcome = self
            .services
            .transport
            .send(TransportRequest {
                url: url.clone(),
                content_type: encoded.content_type,
                body: encoded.body,
                client_certificate_ref: client_certificate_ref(&pmode),
            })
            .await;
        let verdict = classify(&outcome);
        context.send_result = Some(verdict);

        if let TransportOutcome::Response { content_type, body, .. } = &outcome {
            if verdict.is_success() && !body.is_empty() {
                context.transport_response = Some(ReceivedMessage::new(
                    content_type.clone().unwrap_or_default(),
                    body.clone(),
                ));
            }
        }

        self.settle(context, &pmode, verdict).await?;

        if verdict.is_success() {
            info!(message_id = %message_id, url = %url, "Message sent");
            return Ok(StepOutcome::Continue);
        }
        let error = attempt_error(&outcome, verdict);
        warn!(message_id = %message_id, url = %url, ?verdict, error = %error, "Send attempt failed");
        context.fail_with(&error);
        Ok(StepOutcome::Fail)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
