//! Receive error path
//!
//! Runs on the context of a failed receive: answers the partner with an
//! Error signal and records the failure as an InException.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use msh_core::errors::ErrorKind;
use msh_core::ledger::{ExceptionRecord, RetryOwner, RetryReliability, RetryType};
use msh_core::message::SignalMessage;
use msh_core::pmode::to_snapshot;
use msh_core::{As4Message, Direction, ErrorCode, MessagingContext, MshError, MshResult, Operation, Status, Step, StepOutcome};

use crate::services::Services;

fn require_error(context: &MessagingContext) -> MshResult<msh_core::ErrorResult> {
    context
        .error_result
        .clone()
        .ok_or_else(|| MshError::pipeline_error("Error path entered without an error"))
}

/// Replace any reply with an Error signal describing the failure
pub struct CreateErrorSignal {
    services: Arc<Services>,
}

impl CreateErrorSignal {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for CreateErrorSignal {
    fn name(&self) -> &'static str {
        "create_error_signal"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let error = require_error(context)?;
        let ref_to = context
            .as4_message
            .as_ref()
            .and_then(|m| m.primary_message_id())
            .map(str::to_string);
        let code = match error.kind {
            ErrorKind::Internal => ErrorCode::Other,
            _ => error.code,
        };

        let signal = SignalMessage::error_for(
            ref_to.clone(),
            code,
            error.partner_description(),
            self.services.time_source.now(),
        );
        debug!(ref_to = ?ref_to, code = code.code(), "Error signal created");
        context.reply = Some(As4Message::from_signal(signal));
        Ok(StepOutcome::Continue)
    }
}

/// Record the failed reception and queue consumer notification
pub struct StoreInException {
    services: Arc<Services>,
}

impl StoreInException {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for StoreInException {
    fn name(&self) -> &'static str {
        "store_in_exception"
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let error = require_error(context)?;
        let ledger = self.services.ledger.as_ref();
        let ref_to = context
            .as4_message
            .as_ref()
            .and_then(|m| m.primary_message_id())
            .map(str::to_string);

        let mut exception = ExceptionRecord::new(
            Direction::In,
            ref_to.clone(),
            error.description.clone(),
            self.services.time_source.now(),
        );
        let handling = context.receiving_pmode.as_ref().map(|p| &p.exception_handling);
        if let Some(pmode) = &context.receiving_pmode {
            exception.pmode_id = Some(pmode.id.clone());
            exception.pmode_snapshot = Some(to_snapshot(pmode.as_ref())?);
        }
        let notify = handling.map_or(false, |h| h.notify_message_consumer);
        if notify {
            exception.operation = Operation::ToBeNotified;
        }
        let exception_id = ledger.insert_exception(exception).await?;

        if let Some(handling) = handling.filter(|h| h.notify_message_consumer && h.reliability.is_enabled) {
            let rr = RetryReliability::from_config(
                RetryOwner::InException(exception_id),
                RetryType::Notification,
                &handling.reliability,
            );
            ledger.insert_retry_reliability(rr).await?;
        }

        // Only an original stored by this invocation is marked; duplicates keep their state
        if let Some(id) = ref_to.as_deref() {
            if context.duplicates.get(id) == Some(&false) {
                ledger
                    .update_by_message_id(Direction::In, id, &mut |record| {
                        if !record.is_duplicate {
                            record.status = Status::Exception;
                        }
                    })
                    .await?;
            }
        }

        warn!(
            exception = %exception_id,
            ref_to = ?ref_to,
            kind = ?error.kind,
            code = error.code.code(),
            notify,
            "Reception failed"
        );
        Ok(StepOutcome::Continue)
    }
}
