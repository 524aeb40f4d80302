//! Retry/backoff engine
//!
//! Applies the verdict of a deliver, notify or send attempt to the owning
//! record and its retry reliability record. What "success" and "failure"
//! mean for a particular owner is supplied through [`RetryCallbacks`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{MshError, MshResult};
use crate::ledger::{
    ExceptionRecord, Ledger, Operation, ReliabilityStatus, RetryOwner, RetryReliability, RetryType, Status,
};
use crate::pmode::SendingPMode;
use crate::send_result::SendResult;
use crate::types::{Direction, TimeSource};

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

/// Owner-specific effects of a final verdict
#[async_trait]
pub trait RetryCallbacks: Send + Sync {
    async fn on_success(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()>;

    /// Called once the owner is about to be dead-lettered
    async fn on_failure(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()>;
}

fn message_owner(owner: RetryOwner) -> MshResult<(Direction, crate::types::RecordId)> {
    match owner {
        RetryOwner::InMessage(id) => Ok((Direction::In, id)),
        RetryOwner::OutMessage(id) => Ok((Direction::Out, id)),
        other => Err(MshError::pipeline_error(format!(
            "Message callbacks used for {:?}",
            other
        ))),
    }
}

async fn set_message_state(
    ledger: &dyn Ledger,
    owner: RetryOwner,
    operation: Option<Operation>,
    status: Status,
) -> MshResult<()> {
    let (direction, record_id) = message_owner(owner)?;
    ledger
        .update_record(direction, record_id, &mut |record| {
            if let Some(operation) = operation {
                record.operation = operation;
            }
            record.status = status;
        })
        .await?;
    Ok(())
}

/// Delivery of a received user message
pub struct DeliverCallbacks;

#[async_trait]
impl RetryCallbacks for DeliverCallbacks {
    async fn on_success(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, Some(Operation::Delivered), Status::Delivered).await
    }

    async fn on_failure(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, None, Status::Exception).await
    }
}

/// Notification of a receipt or error (received or synthesized)
pub struct NotifyMessageCallbacks;

#[async_trait]
impl RetryCallbacks for NotifyMessageCallbacks {
    async fn on_success(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, Some(Operation::Notified), Status::Notified).await
    }

    async fn on_failure(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, None, Status::Exception).await
    }
}

/// Notification of an In/Out exception
pub struct NotifyExceptionCallbacks;

#[async_trait]
impl RetryCallbacks for NotifyExceptionCallbacks {
    async fn on_success(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        match owner {
            RetryOwner::InException(id) | RetryOwner::OutException(id) => {
                ledger
                    .update_exception(id, &mut |record| record.operation = Operation::Notified)
                    .await?;
                Ok(())
            }
            other => Err(MshError::pipeline_error(format!(
                "Exception callbacks used for {:?}",
                other
            ))),
        }
    }

    async fn on_failure(&self, _ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        warn!(?owner, "Exception notification given up");
        Ok(())
    }
}

/// Push send of an outbound message without reception awareness
///
/// A failed send is recorded as an OutException, queued for notification
/// when the PMode asks for it.
pub struct SendCallbacks {
    pmode: Option<Arc<SendingPMode>>,
    time_source: Arc<dyn TimeSource>,
}

impl SendCallbacks {
    pub fn new(pmode: Option<Arc<SendingPMode>>, time_source: Arc<dyn TimeSource>) -> Self {
        Self { pmode, time_source }
    }
}

#[async_trait]
impl RetryCallbacks for SendCallbacks {
    async fn on_success(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, Some(Operation::Sent), Status::Sent).await
    }

    async fn on_failure(&self, ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<()> {
        set_message_state(ledger, owner, None, Status::Exception).await?;

        let (direction, record_id) = message_owner(owner)?;
        let record = ledger.get_record(direction, record_id).await?;
        let ref_to = record.as_ref().map(|r| r.ebms_message_id.clone());

        let mut exception = ExceptionRecord::new(
            Direction::Out,
            ref_to,
            "Message could not be sent",
            self.time_source.now(),
        );
        if let Some(record) = &record {
            exception.pmode_id = record.pmode_id.clone();
            exception.pmode_snapshot = record.pmode_snapshot.clone();
        }

        let handling = self.pmode.as_ref().map(|p| &p.exception_handling);
        let notify = handling.map_or(false, |h| h.notify_message_producer);
        if notify {
            exception.operation = Operation::ToBeNotified;
        }
        let exception_id = ledger.insert_exception(exception).await?;

        if let Some(handling) = handling.filter(|h| h.notify_message_producer && h.reliability.is_enabled) {
            let rr = RetryReliability::from_config(
                RetryOwner::OutException(exception_id),
                RetryType::Notification,
                &handling.reliability,
            );
            ledger.insert_retry_reliability(rr).await?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Retry Engine
// ----------------------------------------------------------------------------

/// What the engine did with a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Side-effect succeeded
    Completed,
    /// Owner parked in ToBeRetried; `attempt` is the retry number
    Retry { attempt: u32 },
    /// Owner dead-lettered
    DeadLettered,
}

/// Counters of one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweepReport {
    /// Owners moved back to their queue
    pub requeued: usize,
    /// Reliability records closed because their owner already finished
    pub completed: usize,
}

pub struct RetryEngine {
    ledger: Arc<dyn Ledger>,
    time_source: Arc<dyn TimeSource>,
}

impl RetryEngine {
    pub fn new(ledger: Arc<dyn Ledger>, time_source: Arc<dyn TimeSource>) -> Self {
        Self { ledger, time_source }
    }

    /// Apply the verdict of one attempt
    pub async fn handle(
        &self,
        owner: RetryOwner,
        verdict: SendResult,
        callbacks: &dyn RetryCallbacks,
    ) -> MshResult<RetryDecision> {
        let ledger = self.ledger.as_ref();
        let reliability = ledger
            .retry_reliability_for(owner)
            .await?
            .filter(|rr| rr.status == ReliabilityStatus::Pending);

        match (verdict, reliability) {
            (SendResult::Success, reliability) => {
                callbacks.on_success(ledger, owner).await?;
                if let Some(rr) = reliability {
                    self.complete(rr.id).await?;
                }
                debug!(?owner, "Attempt succeeded");
                Ok(RetryDecision::Completed)
            }
            (SendResult::RetryableFail, Some(rr)) if rr.has_retries_left() => {
                let now = self.time_source.now();
                self.ledger
                    .update_retry_reliability(rr.id, &mut |r| {
                        r.current_retry_count += 1;
                        r.last_retry_time = Some(now);
                    })
                    .await?;
                transition_owner(ledger, owner, Operation::ToBeRetried).await?;

                let attempt = rr.current_retry_count + 1;
                info!(?owner, attempt, max = rr.max_retry_count, "Attempt failed, retry scheduled");
                Ok(RetryDecision::Retry { attempt })
            }
            (verdict, reliability) => {
                warn!(?owner, ?verdict, "Attempt failed for good, dead-lettering");
                callbacks.on_failure(ledger, owner).await?;
                transition_owner(ledger, owner, Operation::DeadLettered).await?;
                if let Some(rr) = reliability {
                    self.complete(rr.id).await?;
                }
                Ok(RetryDecision::DeadLettered)
            }
        }
    }

    /// Move owners whose backoff elapsed back to their work queue
    pub async fn sweep(&self) -> MshResult<RetrySweepReport> {
        let now = self.time_source.now();
        let ledger = self.ledger.as_ref();
        let mut report = RetrySweepReport::default();

        for rr in ledger.pending_retry_reliabilities().await? {
            let current = match owner_operation(ledger, rr.owner).await? {
                Some(operation) => operation,
                None => {
                    self.complete(rr.id).await?;
                    report.completed += 1;
                    continue;
                }
            };

            if current.is_terminal() {
                self.complete(rr.id).await?;
                report.completed += 1;
                continue;
            }
            if current != Operation::ToBeRetried {
                continue;
            }

            let due = rr.next_attempt_at().map_or(true, |deadline| now >= deadline);
            if !due {
                continue;
            }

            let target = requeue_operation(&rr);
            if transition_owner(ledger, rr.owner, target).await? {
                debug!(owner = ?rr.owner, ?target, "Retry due, owner requeued");
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn complete(&self, id: u64) -> MshResult<()> {
        self.ledger
            .update_retry_reliability(id, &mut |r| r.status = ReliabilityStatus::Completed)
            .await?;
        Ok(())
    }
}

fn requeue_operation(rr: &RetryReliability) -> Operation {
    match (rr.owner, rr.retry_type) {
        (RetryOwner::OutMessage(_), RetryType::Delivery) => Operation::ToBeSent,
        (_, RetryType::Delivery) => Operation::ToBeDelivered,
        (_, RetryType::Notification) => Operation::ToBeNotified,
    }
}

async fn owner_operation(ledger: &dyn Ledger, owner: RetryOwner) -> MshResult<Option<Operation>> {
    Ok(match owner {
        RetryOwner::InMessage(id) => ledger.get_record(Direction::In, id).await?.map(|r| r.operation),
        RetryOwner::OutMessage(id) => ledger.get_record(Direction::Out, id).await?.map(|r| r.operation),
        RetryOwner::InException(id) | RetryOwner::OutException(id) => {
            ledger.get_exception(id).await?.map(|r| r.operation)
        }
    })
}

async fn transition_owner(ledger: &dyn Ledger, owner: RetryOwner, operation: Operation) -> MshResult<bool> {
    let updated = match owner {
        RetryOwner::InMessage(id) => {
            ledger
                .update_record(Direction::In, id, &mut |r| r.operation = operation)
                .await?
        }
        RetryOwner::OutMessage(id) => {
            ledger
                .update_record(Direction::Out, id, &mut |r| r.operation = operation)
                .await?
        }
        RetryOwner::InException(id) | RetryOwner::OutException(id) => {
            ledger
                .update_exception(id, &mut |r| r.operation = operation)
                .await?
        }
    };
    Ok(updated)
}
