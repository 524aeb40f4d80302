//! Message Ledger
//!
//! Durable bookkeeping of every message, exception and reliability record
//! the MSH handles. The ledger is the only shared mutable state between
//! pipelines and agents: work is handed over by committing operation
//! transitions, and concurrent workers claim records with a compare-and-set
//! transition before acting on them.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::errors::LedgerError;
use crate::message::MessageUnit;
use crate::pmode::RetryConfig;
use crate::types::{Direction, ExceptionId, Mep, MessageType, RecordId, Timestamp};

pub use memory::{InMemoryBodyStore, InMemoryLedger};

pub type LedgerResult<T> = core::result::Result<T, LedgerError>;

/// Mutation applied to a stored record under the ledger's per-record lock
pub type RecordMutator<'a> = &'a mut (dyn for<'r> FnMut(&'r mut MessageRecord) + Send);

pub type ExceptionMutator<'a> = &'a mut (dyn for<'r> FnMut(&'r mut ExceptionRecord) + Send);

pub type ReceptionAwarenessMutator<'a> = &'a mut (dyn for<'r> FnMut(&'r mut ReceptionAwareness) + Send);

pub type RetryReliabilityMutator<'a> = &'a mut (dyn for<'r> FnMut(&'r mut RetryReliability) + Send);

// ----------------------------------------------------------------------------
// Operation Lifecycle
// ----------------------------------------------------------------------------

/// Work still to be done for a record
///
/// Operations only move forward. The reception awareness resend edge
/// (`Sent`/`ToBeRetried` back to `ToBeSent`), retry re-entry and releasing a
/// send claim of a cancelled invocation (`Sending` back to `ToBeSent`) are the
/// only loops, and all are explicit successors below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Created,
    ToBeSent,
    Sending,
    Sent,
    ToBePiggyBacked,
    ToBeDelivered,
    Delivering,
    Delivered,
    ToBeNotified,
    Notifying,
    Notified,
    ToBeRetried,
    DeadLettered,
}

impl Operation {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: Operation) -> bool {
        use Operation::*;

        if *self == next {
            return *self != DeadLettered;
        }
        if next == DeadLettered {
            return true;
        }

        match self {
            Created => matches!(next, ToBeSent | ToBePiggyBacked | ToBeDelivered | ToBeNotified),
            ToBeSent => matches!(next, Sending | Sent),
            Sending => matches!(next, ToBeSent | Sent | ToBeRetried | ToBePiggyBacked),
            Sent => matches!(next, ToBeSent),
            ToBePiggyBacked => matches!(next, Sending),
            ToBeDelivered => matches!(next, Delivering),
            Delivering => matches!(next, Delivered | ToBeRetried),
            ToBeNotified => matches!(next, Notifying),
            Notifying => matches!(next, Notified | ToBeRetried),
            ToBeRetried => matches!(
                next,
                Delivering | Notifying | Sending | ToBeSent | ToBeDelivered | ToBeNotified
            ),
            Delivered | Notified | DeadLettered => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Operation::Delivered | Operation::Notified | Operation::DeadLettered)
    }
}

/// Protocol-level outcome of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Created,
    Received,
    Sent,
    Ack,
    Nack,
    Delivered,
    Notified,
    Exception,
}

impl Status {
    /// Whether a receipt or error has answered the message
    pub fn is_answered(&self) -> bool {
        matches!(self, Status::Ack | Status::Nack)
    }
}

// ----------------------------------------------------------------------------
// Message Records
// ----------------------------------------------------------------------------

/// Stored InMessage or OutMessage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Assigned by the ledger on insert
    pub record_id: RecordId,
    pub direction: Direction,
    pub ebms_message_id: String,
    pub ebms_ref_to_message_id: Option<String>,
    pub message_type: MessageType,
    pub mpc: Option<String>,
    pub mep: Mep,
    pub operation: Operation,
    pub status: Status,
    pub pmode_id: Option<String>,
    /// Serialized PMode the record was processed under
    pub pmode_snapshot: Option<String>,
    /// Destination url for outbound records
    pub url: Option<String>,
    /// Where the serialized message body lives in the body store
    pub message_location: Option<String>,
    pub insertion_time: Timestamp,
    pub modification_time: Timestamp,
    pub is_duplicate: bool,
    pub is_test: bool,
    /// Record forwarded on behalf of another MSH
    pub intermediary: bool,
}

impl MessageRecord {
    /// Create an unsaved record describing a message unit
    pub fn for_unit(direction: Direction, unit: &MessageUnit, now: Timestamp) -> Self {
        let (mpc, is_test) = match unit {
            MessageUnit::User(user) => (Some(user.mpc.clone()), user.is_test_message()),
            MessageUnit::Signal(crate::message::SignalMessage::PullRequest(pr)) => {
                (Some(pr.mpc.clone()), false)
            }
            MessageUnit::Signal(_) => (None, false),
        };

        Self {
            record_id: RecordId::new(0),
            direction,
            ebms_message_id: unit.message_id().to_string(),
            ebms_ref_to_message_id: unit.ref_to_message_id().map(str::to_string),
            message_type: unit.message_type(),
            mpc,
            mep: Mep::Push,
            operation: Operation::Created,
            status: match direction {
                Direction::In => Status::Received,
                Direction::Out => Status::Created,
            },
            pmode_id: None,
            pmode_snapshot: None,
            url: None,
            message_location: None,
            insertion_time: now,
            modification_time: now,
            is_duplicate: false,
            is_test,
            intermediary: false,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_pmode(mut self, pmode_id: impl Into<String>, snapshot: String) -> Self {
        self.pmode_id = Some(pmode_id.into());
        self.pmode_snapshot = Some(snapshot);
        self
    }

    pub fn with_mep(mut self, mep: Mep) -> Self {
        self.mep = mep;
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }
}

/// Result of inserting a message record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub record_id: RecordId,
    /// Set when a non-duplicate record with the same id already existed
    pub is_duplicate: bool,
}

// ----------------------------------------------------------------------------
// Exception Records
// ----------------------------------------------------------------------------

/// Stored InException or OutException
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub exception_id: ExceptionId,
    pub direction: Direction,
    pub ebms_ref_to_message_id: Option<String>,
    pub exception_text: String,
    pub pmode_id: Option<String>,
    pub pmode_snapshot: Option<String>,
    pub operation: Operation,
    pub insertion_time: Timestamp,
    pub modification_time: Timestamp,
}

impl ExceptionRecord {
    pub fn new(
        direction: Direction,
        ref_to: Option<String>,
        exception_text: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            exception_id: ExceptionId::new(0),
            direction,
            ebms_ref_to_message_id: ref_to,
            exception_text: exception_text.into(),
            pmode_id: None,
            pmode_snapshot: None,
            operation: Operation::Created,
            insertion_time: now,
            modification_time: now,
        }
    }
}

// ----------------------------------------------------------------------------
// Reliability Records
// ----------------------------------------------------------------------------

/// Shared lifecycle of reliability records; `Completed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReliabilityStatus {
    Pending,
    Completed,
}

/// Resend-until-acknowledged tracking for one pushed user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceptionAwareness {
    /// Assigned by the ledger on insert
    pub id: u64,
    pub ref_to_out_message_id: RecordId,
    pub ref_to_ebms_message_id: String,
    pub status: ReliabilityStatus,
    pub current_retry_count: u32,
    pub total_retry_count: u32,
    pub retry_interval_ms: u64,
    pub last_send_time: Timestamp,
}

impl ReceptionAwareness {
    pub fn new(
        out_record: RecordId,
        ebms_message_id: impl Into<String>,
        total_retry_count: u32,
        retry_interval: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            id: 0,
            ref_to_out_message_id: out_record,
            ref_to_ebms_message_id: ebms_message_id.into(),
            status: ReliabilityStatus::Pending,
            current_retry_count: 0,
            total_retry_count,
            retry_interval_ms: retry_interval.as_millis() as u64,
            last_send_time: now,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_retry_count >= self.total_retry_count
    }

    /// Whether the wait for an answer to the last send has elapsed
    pub fn is_due(&self, now: Timestamp) -> bool {
        now.has_elapsed(self.last_send_time, self.retry_interval())
    }

    /// Administrative reset: start counting resends from zero again
    pub fn reset(&mut self, now: Timestamp) {
        self.status = ReliabilityStatus::Pending;
        self.current_retry_count = 0;
        self.last_send_time = now;
    }
}

/// Record a retry/reliability record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryOwner {
    InMessage(RecordId),
    OutMessage(RecordId),
    InException(ExceptionId),
    OutException(ExceptionId),
}

/// Side-effect a retry record guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryType {
    Delivery,
    Notification,
}

/// Backoff tracking for a deliver or notify side-effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryReliability {
    /// Assigned by the ledger on insert
    pub id: u64,
    pub owner: RetryOwner,
    pub retry_type: RetryType,
    pub current_retry_count: u32,
    pub max_retry_count: u32,
    pub retry_interval_ms: u64,
    pub backoff_multiplier: f32,
    pub max_retry_interval_ms: u64,
    pub last_retry_time: Option<Timestamp>,
    pub status: ReliabilityStatus,
}

impl RetryReliability {
    pub fn from_config(owner: RetryOwner, retry_type: RetryType, config: &RetryConfig) -> Self {
        Self {
            id: 0,
            owner,
            retry_type,
            current_retry_count: 0,
            max_retry_count: config.retry_count,
            retry_interval_ms: config.retry_interval_ms,
            backoff_multiplier: config.backoff_multiplier,
            max_retry_interval_ms: config.max_retry_interval_ms,
            last_retry_time: None,
            status: ReliabilityStatus::Pending,
        }
    }

    pub fn has_retries_left(&self) -> bool {
        self.current_retry_count < self.max_retry_count
    }

    /// Delay before the next attempt: `interval * multiplier^(current - 1)`, capped
    pub fn current_backoff(&self) -> Duration {
        let exponent = self.current_retry_count.saturating_sub(1) as i32;
        let multiplier = f64::from(self.backoff_multiplier.max(1.0));
        let delay = self.retry_interval_ms as f64 * multiplier.powi(exponent);
        let capped = if self.max_retry_interval_ms > 0 {
            delay.min(self.max_retry_interval_ms as f64)
        } else {
            delay
        };
        Duration::from_millis(capped as u64)
    }

    /// Earliest time the owner may be retried again
    pub fn next_attempt_at(&self) -> Option<Timestamp> {
        self.last_retry_time.map(|last| last + self.current_backoff())
    }
}

// ----------------------------------------------------------------------------
// Ledger Contract
// ----------------------------------------------------------------------------

/// Persistent store of message, exception and reliability records
///
/// Every per-record update is atomic with respect to other updates of the
/// same record, and every operation change is validated with
/// [`Operation::can_transition_to`].
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Which of `ids` already exist as non-duplicate records
    async fn find_existing_ids(&self, direction: Direction, ids: &[String]) -> LedgerResult<HashSet<String>>;

    /// Which of `refs` are already answered by a stored receipt or error
    async fn find_existing_refs(&self, direction: Direction, refs: &[String]) -> LedgerResult<HashSet<String>>;

    /// Store a record; a second non-duplicate with the same id is stored as duplicate
    async fn insert(&self, record: MessageRecord) -> LedgerResult<Inserted>;

    /// Mutate every record with the given ebMS id, returning how many changed
    async fn update_by_message_id(
        &self,
        direction: Direction,
        ebms_message_id: &str,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<usize>;

    /// Mutate a single record
    async fn update_record(
        &self,
        direction: Direction,
        record_id: RecordId,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<bool>;

    /// Claim a record: move it to `to` only if its operation is one of `from`
    async fn try_transition(
        &self,
        direction: Direction,
        record_id: RecordId,
        from: &[Operation],
        to: Operation,
    ) -> LedgerResult<bool>;

    /// Stored PMode snapshot of the first non-duplicate record with this id
    async fn get_pmode_snapshot(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Option<String>>;

    /// Most recently modified non-intermediary OutMessage with this id
    async fn latest_out_message(&self, ebms_message_id: &str) -> LedgerResult<Option<MessageRecord>>;

    async fn get_record(&self, direction: Direction, record_id: RecordId) -> LedgerResult<Option<MessageRecord>>;

    async fn find_by_message_id(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Vec<MessageRecord>>;

    /// Records currently in `operation`, oldest first, at most `limit`
    async fn find_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>>;

    /// Pull-MEP user messages waiting in `ToBeSent` on `mpc`, oldest first, at most `limit`
    async fn find_pull_candidates(&self, mpc: &str, limit: usize) -> LedgerResult<Vec<MessageRecord>>;

    /// OutMessages in `ToBeSent` the send agent may push, oldest first, at most `limit`
    ///
    /// Pull-MEP user messages wait for a PullRequest and are never returned.
    async fn find_push_candidates(&self, limit: usize) -> LedgerResult<Vec<MessageRecord>>;

    /// Receipts and errors in `ToBePiggyBacked` that answer a user message
    /// received on `mpc`, oldest first, at most `limit`
    ///
    /// A signal with a target URL only matches when `url` is that URL.
    async fn find_piggyback_candidates(
        &self,
        mpc: &str,
        url: Option<&str>,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>>;

    // Exceptions

    async fn insert_exception(&self, record: ExceptionRecord) -> LedgerResult<ExceptionId>;

    async fn update_exception(
        &self,
        exception_id: ExceptionId,
        mutator: ExceptionMutator<'_>,
    ) -> LedgerResult<bool>;

    async fn get_exception(&self, exception_id: ExceptionId) -> LedgerResult<Option<ExceptionRecord>>;

    async fn find_exceptions_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<ExceptionRecord>>;

    // Reception awareness

    async fn insert_reception_awareness(&self, record: ReceptionAwareness) -> LedgerResult<u64>;

    async fn pending_reception_awareness(&self) -> LedgerResult<Vec<ReceptionAwareness>>;

    async fn reception_awareness_for(&self, out_record: RecordId) -> LedgerResult<Option<ReceptionAwareness>>;

    async fn update_reception_awareness(
        &self,
        id: u64,
        mutator: ReceptionAwarenessMutator<'_>,
    ) -> LedgerResult<bool>;

    // Retry reliability

    async fn insert_retry_reliability(&self, record: RetryReliability) -> LedgerResult<u64>;

    async fn retry_reliability_for(&self, owner: RetryOwner) -> LedgerResult<Option<RetryReliability>>;

    async fn pending_retry_reliabilities(&self) -> LedgerResult<Vec<RetryReliability>>;

    async fn update_retry_reliability(
        &self,
        id: u64,
        mutator: RetryReliabilityMutator<'_>,
    ) -> LedgerResult<bool>;
}

/// Storage of serialized message bodies referenced by `message_location`
#[async_trait]
pub trait MessageBodyStore: Send + Sync {
    /// Persist a body and return its location
    async fn save(&self, ebms_message_id: &str, body: &[u8]) -> LedgerResult<String>;

    async fn load(&self, location: &str) -> LedgerResult<Vec<u8>>;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
