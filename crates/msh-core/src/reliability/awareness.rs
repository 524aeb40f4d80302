//! Reception awareness
//!
//! A pushed user message with reception awareness enabled is resent until a
//! receipt or error arrives. When the configured number of resends is used up
//! and the final wait elapses, the message is dead-lettered and a
//! `MissingReceipt` error is synthesized as if the partner had sent it.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::MshResult;
use crate::ledger::{
    Ledger, MessageRecord, Operation, ReceptionAwareness, ReliabilityStatus, RetryOwner, RetryReliability,
    RetryType, Status,
};
use crate::message::{ErrorCode, MessageUnit, SignalMessage};
use crate::pmode::{from_snapshot, SendingPMode};
use crate::types::{Direction, RecordId, TimeSource};

/// Counters of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records closed because their message was answered
    pub completed: usize,
    /// Messages moved back to ToBeSent
    pub resends: usize,
    /// Messages given up on
    pub dead_lettered: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.completed == 0 && self.resends == 0 && self.dead_lettered == 0
    }
}

/// Drives reception awareness records
pub struct ReceptionAwarenessEngine {
    ledger: Arc<dyn Ledger>,
    time_source: Arc<dyn TimeSource>,
}

impl ReceptionAwarenessEngine {
    pub fn new(ledger: Arc<dyn Ledger>, time_source: Arc<dyn TimeSource>) -> Self {
        Self { ledger, time_source }
    }

    /// Track a send attempt of an outbound user message
    ///
    /// The first attempt creates the record; every later attempt counts as a
    /// resend. Attempts after the record completed are ignored.
    pub async fn record_send_attempt(
        &self,
        out_record: RecordId,
        ebms_message_id: &str,
        pmode: &SendingPMode,
    ) -> MshResult<()> {
        if !pmode.reception_awareness_enabled() {
            return Ok(());
        }
        let now = self.time_source.now();

        match self.ledger.reception_awareness_for(out_record).await? {
            None => {
                let config = &pmode.reliability.reception_awareness;
                let record = ReceptionAwareness::new(
                    out_record,
                    ebms_message_id,
                    config.retry_count,
                    config.retry_interval(),
                    now,
                );
                self.ledger.insert_reception_awareness(record).await?;
                debug!(message_id = ebms_message_id, "Reception awareness started");
            }
            Some(existing) if existing.status == ReliabilityStatus::Pending => {
                self.ledger
                    .update_reception_awareness(existing.id, &mut |ra| {
                        ra.current_retry_count += 1;
                        ra.last_send_time = now;
                    })
                    .await?;
                debug!(
                    message_id = ebms_message_id,
                    resend = existing.current_retry_count + 1,
                    of = existing.total_retry_count,
                    "Reception awareness resend recorded"
                );
            }
            Some(_) => {
                debug!(message_id = ebms_message_id, "Send attempt after reception awareness completed");
            }
        }
        Ok(())
    }

    /// Evaluate every pending record once
    pub async fn sweep(&self) -> MshResult<SweepReport> {
        let now = self.time_source.now();
        let mut report = SweepReport::default();

        for awareness in self.ledger.pending_reception_awareness().await? {
            let out = match self
                .ledger
                .get_record(Direction::Out, awareness.ref_to_out_message_id)
                .await?
            {
                Some(out) => out,
                None => {
                    warn!(
                        record = %awareness.ref_to_out_message_id,
                        "Reception awareness for unknown OutMessage, completing"
                    );
                    self.complete(awareness.id).await?;
                    report.completed += 1;
                    continue;
                }
            };

            if out.status.is_answered() || out.operation == Operation::DeadLettered {
                self.complete(awareness.id).await?;
                report.completed += 1;
                continue;
            }

            // An attempt is in flight; its outcome decides the next step
            if out.operation == Operation::Sending || !awareness.is_due(now) {
                continue;
            }

            if !awareness.is_exhausted() {
                let claimed = self
                    .ledger
                    .try_transition(
                        Direction::Out,
                        out.record_id,
                        &[Operation::Sent, Operation::ToBeRetried],
                        Operation::ToBeSent,
                    )
                    .await?;
                if claimed {
                    info!(
                        message_id = %out.ebms_message_id,
                        resend = awareness.current_retry_count + 1,
                        of = awareness.total_retry_count,
                        "Unanswered message scheduled for resend"
                    );
                    report.resends += 1;
                }
                continue;
            }

            self.dead_letter(&awareness, &out).await?;
            report.dead_lettered += 1;
        }

        if !report.is_empty() {
            debug!(?report, "Reception awareness sweep finished");
        }
        Ok(report)
    }

    async fn complete(&self, id: u64) -> MshResult<()> {
        self.ledger
            .update_reception_awareness(id, &mut |ra| ra.status = ReliabilityStatus::Completed)
            .await?;
        Ok(())
    }

    /// Give up on an unanswered message
    ///
    /// The synthetic `MissingReceipt` error is stored before the OutMessage
    /// leaves its current operation: a sweep that fails half-way runs again
    /// and finds the error already there instead of completing without it.
    async fn dead_letter(&self, awareness: &ReceptionAwareness, out: &MessageRecord) -> MshResult<()> {
        warn!(
            message_id = %out.ebms_message_id,
            resends = awareness.current_retry_count,
            "No receipt after final resend, dead-lettering"
        );

        let answered = self
            .ledger
            .find_existing_refs(Direction::In, std::slice::from_ref(&out.ebms_message_id))
            .await?;
        if answered.contains(&out.ebms_message_id) {
            debug!(message_id = %out.ebms_message_id, "Missing receipt error already stored");
        } else {
            self.store_missing_receipt_error(awareness, out).await?;
        }

        self.ledger
            .update_record(Direction::Out, out.record_id, &mut |record| {
                record.operation = Operation::DeadLettered;
                record.status = Status::Exception;
            })
            .await?;
        self.complete(awareness.id).await
    }

    async fn store_missing_receipt_error(&self, awareness: &ReceptionAwareness, out: &MessageRecord) -> MshResult<()> {
        let now = self.time_source.now();
        let pmode: Option<SendingPMode> = match out.pmode_snapshot.as_deref() {
            Some(snapshot) => match from_snapshot(snapshot) {
                Ok(pmode) => Some(pmode),
                Err(e) => {
                    warn!(message_id = %out.ebms_message_id, error = %e, "Unreadable PMode snapshot");
                    None
                }
            },
            None => None,
        };
        let error_handling = pmode.as_ref().map(|p| &p.error_handling);
        let notify = error_handling.map_or(false, |h| h.notify_message_producer);

        let signal = SignalMessage::error_for(
            Some(out.ebms_message_id.clone()),
            ErrorCode::MissingReceipt,
            format!(
                "No receipt received after {} resends",
                awareness.current_retry_count
            ),
            now,
        );
        let mut record = MessageRecord::for_unit(Direction::In, &MessageUnit::Signal(signal), now)
            .with_operation(if notify { Operation::ToBeNotified } else { Operation::Created });
        record.pmode_id = out.pmode_id.clone();
        record.pmode_snapshot = out.pmode_snapshot.clone();
        let inserted = self.ledger.insert(record).await?;

        if let Some(handling) = error_handling.filter(|h| h.notify_message_producer && h.reliability.is_enabled) {
            let rr = RetryReliability::from_config(
                RetryOwner::InMessage(inserted.record_id),
                RetryType::Notification,
                &handling.reliability,
            );
            self.ledger.insert_retry_reliability(rr).await?;
        }
        Ok(())
    }
}
