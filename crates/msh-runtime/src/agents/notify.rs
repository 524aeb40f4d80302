//! Notification of receipts, errors and exceptions

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use msh_core::pmode::{from_snapshot, Method, ReceivingPMode, SendingPMode};
use msh_core::reliability::{NotifyExceptionCallbacks, NotifyMessageCallbacks};
use msh_core::send_result::classify_error;
use msh_core::{
    Direction, ExceptionRecord, MessageRecord, MessageType, MshError, MshResult, NotifyMessage, Operation, RetryOwner,
    SendResult,
};

use super::{settle_batch, Agent};
use crate::msh::Msh;

pub struct NotifyAgent {
    msh: Arc<Msh>,
    interval: Duration,
    batch_size: usize,
}

impl NotifyAgent {
    pub fn new(msh: Arc<Msh>, interval: Duration, batch_size: usize) -> Self {
        Self {
            msh,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    async fn attempt(&self, message: MshResult<NotifyMessage>, what: &str) -> SendResult {
        let notifier = match &self.msh.services().notifier {
            Some(notifier) => notifier,
            None => return SendResult::FatalFail,
        };
        match message {
            Ok(message) => match notifier.notify(message).await {
                Ok(()) => SendResult::Success,
                Err(e) => {
                    warn!(target_record = what, error = %e, "Notification failed");
                    classify_error(&e)
                }
            },
            Err(e) => {
                warn!(target_record = what, error = %e, "Notification cannot be built");
                SendResult::FatalFail
            }
        }
    }

    // ------------------------------------------------------------------------
    // Receipts and errors
    // ------------------------------------------------------------------------

    async fn signal_notification(&self, record: &MessageRecord) -> MshResult<NotifyMessage> {
        let snapshot = record.pmode_snapshot.as_deref().ok_or_else(|| {
            MshError::config_error(format!("{} was stored without a PMode", record.ebms_message_id))
        })?;
        let method = match (record.direction, record.message_type) {
            // An error we answered with, stored under the receiving PMode
            (Direction::Out, MessageType::Error) => {
                from_snapshot::<ReceivingPMode>(snapshot)?
                    .reply_handling
                    .error_handling
                    .notify_method
            }
            (Direction::In, MessageType::Receipt) => {
                from_snapshot::<SendingPMode>(snapshot)?.receipt_handling.notify_method
            }
            (Direction::In, MessageType::Error) => from_snapshot::<SendingPMode>(snapshot)?.error_handling.notify_method,
            (_, other) => {
                return Err(MshError::pipeline_error(format!(
                    "{:?} {} queued for notification",
                    other, record.ebms_message_id
                )))
            }
        };

        // Errors synthesized for missing receipts have no stored body
        let body = match record.message_location.as_deref() {
            Some(location) => self.msh.services().bodies.load(location).await?,
            None => Vec::new(),
        };
        Ok(NotifyMessage::Signal {
            record: record.clone(),
            body,
            method,
        })
    }

    async fn notify_signal(&self, record: MessageRecord) -> MshResult<bool> {
        let services = self.msh.services();
        let claimed = services
            .ledger
            .try_transition(record.direction, record.record_id, &[Operation::ToBeNotified], Operation::Notifying)
            .await?;
        if !claimed {
            return Ok(false);
        }

        let message = self.signal_notification(&record).await;
        let verdict = self.attempt(message, &record.ebms_message_id).await;
        let owner = match record.direction {
            Direction::In => RetryOwner::InMessage(record.record_id),
            Direction::Out => RetryOwner::OutMessage(record.record_id),
        };
        let decision = services.retry.handle(owner, verdict, &NotifyMessageCallbacks).await?;
        debug!(message_id = %record.ebms_message_id, ?decision, "Signal notification settled");
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------------

    fn exception_method(exception: &ExceptionRecord) -> MshResult<Method> {
        let snapshot = match exception.pmode_snapshot.as_deref() {
            Some(snapshot) => snapshot,
            None => return Ok(Method::default()),
        };
        Ok(match exception.direction {
            Direction::In => from_snapshot::<ReceivingPMode>(snapshot)?.exception_handling.notify_method,
            Direction::Out => from_snapshot::<SendingPMode>(snapshot)?.exception_handling.notify_method,
        })
    }

    async fn notify_exception(&self, exception: ExceptionRecord) -> MshResult<bool> {
        let services = self.msh.services();
        let mut claimed = false;
        services
            .ledger
            .update_exception(exception.exception_id, &mut |record| {
                if record.operation == Operation::ToBeNotified {
                    record.operation = Operation::Notifying;
                    claimed = true;
                }
            })
            .await?;
        if !claimed {
            return Ok(false);
        }

        let message = Self::exception_method(&exception).map(|method| NotifyMessage::Exception {
            record: exception.clone(),
            method,
        });
        let label = exception.exception_id.to_string();
        let verdict = self.attempt(message, &label).await;

        let owner = match exception.direction {
            Direction::In => RetryOwner::InException(exception.exception_id),
            Direction::Out => RetryOwner::OutException(exception.exception_id),
        };
        let decision = services.retry.handle(owner, verdict, &NotifyExceptionCallbacks).await?;
        debug!(exception = %label, ?decision, "Exception notification settled");
        Ok(true)
    }
}

#[async_trait]
impl Agent for NotifyAgent {
    fn name(&self) -> &str {
        "notify"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        let services = self.msh.services();
        if services.notifier.is_none() {
            return Ok(0);
        }

        let mut signals = services
            .ledger
            .find_by_operation(Direction::In, Operation::ToBeNotified, self.batch_size)
            .await?;
        signals.extend(
            services
                .ledger
                .find_by_operation(Direction::Out, Operation::ToBeNotified, self.batch_size)
                .await?,
        );
        let mut results: Vec<MshResult<bool>> = stream::iter(signals)
            .take_until(cancellation.cancelled())
            .map(|record| self.notify_signal(record))
            .buffer_unordered(self.batch_size)
            .collect()
            .await;

        if cancellation.is_cancelled() {
            return settle_batch(self.name(), results);
        }

        let mut exceptions = services
            .ledger
            .find_exceptions_by_operation(Direction::In, Operation::ToBeNotified, self.batch_size)
            .await?;
        exceptions.extend(
            services
                .ledger
                .find_exceptions_by_operation(Direction::Out, Operation::ToBeNotified, self.batch_size)
                .await?,
        );
        let exception_results: Vec<MshResult<bool>> = stream::iter(exceptions)
            .take_until(cancellation.cancelled())
            .map(|exception| self.notify_exception(exception))
            .buffer_unordered(self.batch_size)
            .collect()
            .await;
        results.extend(exception_results);

        settle_batch(self.name(), results)
    }
}
