//! Pull bundling
//!
//! Both sides of the pull MEP: the initiator piggybacks waiting receipts and
//! errors onto its outgoing PullRequest, and the responder hands out one
//! waiting user message per PullRequest. Records are always claimed with a
//! compare-and-set transition so that concurrent PullRequests never receive
//! the same message twice.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{MshError, MshResult};
use crate::external::MessageCodec;
use crate::ledger::{Ledger, MessageBodyStore, MessageRecord, Operation, Status};
use crate::message::{As4Message, ErrorCode, MessageUnit};
use crate::pmode::SendingPMode;
use crate::types::{Direction, RecordId};

/// Default number of candidate records examined per call
pub const DEFAULT_SCAN_LIMIT: usize = 1_000;

/// Answer to a PullRequest on the responding side
#[derive(Debug, Clone)]
pub enum PullSelection {
    /// A user message was claimed for this PullRequest
    Selected {
        record: MessageRecord,
        message: As4Message,
    },
    /// Nothing waiting on the MPC
    Empty,
}

pub struct PullBundlingService {
    ledger: Arc<dyn Ledger>,
    bodies: Arc<dyn MessageBodyStore>,
    codec: Arc<dyn MessageCodec>,
    scan_limit: usize,
}

impl PullBundlingService {
    pub fn new(ledger: Arc<dyn Ledger>, bodies: Arc<dyn MessageBodyStore>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            ledger,
            bodies,
            codec,
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    pub fn with_scan_limit(mut self, scan_limit: usize) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    async fn load_message(&self, record: &MessageRecord) -> MshResult<As4Message> {
        let location = record.message_location.as_deref().ok_or_else(|| {
            MshError::pipeline_error(format!("{} has no stored body", record.ebms_message_id))
        })?;
        let body = self.bodies.load(location).await?;
        self.codec.deserialize(self.codec.content_type(), &body)
    }

    /// Piggyback waiting receipts and errors onto an outgoing PullRequest
    ///
    /// Returns the OutMessage records claimed for this PullRequest; they are
    /// in `Sending` until [`complete_bundle`](Self::complete_bundle) runs.
    pub async fn bundle(&self, message: &mut As4Message, pmode: &SendingPMode) -> MshResult<Vec<RecordId>> {
        let mpc = match message.pull_request() {
            Some(pr) => pr.mpc.clone(),
            None => {
                return Err(MshError::protocol_violation(
                    ErrorCode::ValueInconsistent,
                    "Signals can only be bundled onto a PullRequest",
                ))
            }
        };
        let url = pmode.push_url();

        let waiting = self
            .ledger
            .find_piggyback_candidates(&mpc, url, self.scan_limit)
            .await?;

        let mut claimed = Vec::new();
        for record in waiting {
            if !self
                .ledger
                .try_transition(
                    Direction::Out,
                    record.record_id,
                    &[Operation::ToBePiggyBacked],
                    Operation::Sending,
                )
                .await?
            {
                continue;
            }

            match self.load_message(&record).await {
                Ok(stored) => {
                    for signal in stored.signal_messages() {
                        message.add_unit(MessageUnit::Signal(signal.clone()));
                    }
                    claimed.push(record.record_id);
                }
                Err(e) => {
                    warn!(message_id = %record.ebms_message_id, error = %e, "Cannot bundle signal, releasing claim");
                    self.ledger
                        .try_transition(
                            Direction::Out,
                            record.record_id,
                            &[Operation::Sending],
                            Operation::ToBePiggyBacked,
                        )
                        .await?;
                }
            }
        }

        if !claimed.is_empty() {
            info!(mpc = %mpc, bundled = claimed.len(), "Signals piggybacked onto PullRequest");
        }
        Ok(claimed)
    }

    /// Settle signals bundled by [`bundle`](Self::bundle) after the send
    pub async fn complete_bundle(&self, claimed: &[RecordId], sent: bool) -> MshResult<()> {
        for record_id in claimed {
            if sent {
                self.ledger
                    .update_record(Direction::Out, *record_id, &mut |r| {
                        r.operation = Operation::Sent;
                        r.status = Status::Sent;
                    })
                    .await?;
            } else {
                self.ledger
                    .try_transition(
                        Direction::Out,
                        *record_id,
                        &[Operation::Sending],
                        Operation::ToBePiggyBacked,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Claim the oldest user message waiting to be pulled from `mpc`
    ///
    /// The body is loaded before the claim, so a message whose body cannot be
    /// read stays in `ToBeSent` and never leaves the queue half-claimed.
    pub async fn select_user_message(&self, mpc: &str) -> MshResult<PullSelection> {
        let waiting = self.ledger.find_pull_candidates(mpc, self.scan_limit).await?;

        for record in waiting {
            let message = match self.load_message(&record).await {
                Ok(message) => message,
                Err(e) => {
                    warn!(mpc, message_id = %record.ebms_message_id, error = %e, "Cannot load pulled message, skipping");
                    continue;
                }
            };

            let mut won = false;
            self.ledger
                .update_record(Direction::Out, record.record_id, &mut |r| {
                    won = r.operation == Operation::ToBeSent;
                    if won {
                        r.operation = Operation::Sent;
                        r.status = Status::Sent;
                    }
                })
                .await?;
            if !won {
                continue;
            }

            let mut record = record;
            record.operation = Operation::Sent;
            record.status = Status::Sent;
            debug!(mpc, message_id = %record.ebms_message_id, "User message selected for PullRequest");
            return Ok(PullSelection::Selected { record, message });
        }

        debug!(mpc, "Nothing waiting on MPC");
        Ok(PullSelection::Empty)
    }
}
