//! Test utilities for deterministic testing of the processing core
//!
//! Provides a JSON codec, message/PMode fixtures and helpers that seed the
//! in-memory ledger the way the send and receive pipelines would.

#![allow(dead_code)]

use msh_core::external::{EncodedMessage, MessageCodec};
use async_trait::async_trait;
use msh_core::errors::LedgerError;
use msh_core::ledger::{
    ExceptionMutator, ExceptionRecord, InMemoryBodyStore, InMemoryLedger, Inserted, Ledger, LedgerResult,
    MessageBodyStore, MessageRecord, Operation, ReceptionAwareness, ReceptionAwarenessMutator, RecordMutator,
    RetryOwner, RetryReliability, RetryReliabilityMutator,
};
use msh_core::message::{As4Message, MessageUnit, Party, Service, UserMessage, DEFAULT_MPC};
use msh_core::pmode::{
    to_snapshot, PushConfiguration, ReceptionAwarenessConfig, RetryConfig, SendingPMode,
};
use msh_core::types::{Direction, ExceptionId, ManualTimeSource, Mep, RecordId, TimeSource};
use msh_core::{MshError, MshResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PARTNER_URL: &str = "http://partner.example/as4";

// ----------------------------------------------------------------------------
// JSON Codec
// ----------------------------------------------------------------------------

/// Codec that stores messages as JSON
#[derive(Debug, Default, Clone)]
pub struct TestCodec;

impl MessageCodec for TestCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type.starts_with("application/json")
    }

    fn serialize(&self, message: &As4Message) -> MshResult<EncodedMessage> {
        Ok(EncodedMessage {
            content_type: self.content_type().to_string(),
            body: serde_json::to_vec(message)?,
        })
    }

    fn deserialize(&self, _content_type: &str, body: &[u8]) -> MshResult<As4Message> {
        serde_json::from_slice(body).map_err(|e| MshError::malformed(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Environment
// ----------------------------------------------------------------------------

/// Ledger, body store and clock sharing one manual time source
pub struct TestEnv {
    pub clock: ManualTimeSource,
    pub ledger: Arc<InMemoryLedger>,
    pub bodies: Arc<InMemoryBodyStore>,
    pub codec: Arc<TestCodec>,
}

impl TestEnv {
    pub fn new() -> Self {
        let clock = ManualTimeSource::new_at(1_000_000);
        Self {
            ledger: Arc::new(InMemoryLedger::new(Arc::new(clock.clone()))),
            bodies: Arc::new(InMemoryBodyStore::new()),
            codec: Arc::new(TestCodec),
            clock,
        }
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        Arc::new(self.clock.clone())
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    /// Store an outbound message as the submit path would
    pub async fn store_out(
        &self,
        message: &As4Message,
        pmode: &SendingPMode,
        operation: Operation,
    ) -> RecordId {
        let unit = message.primary_unit().expect("message has a unit");
        let body = self.codec.serialize(message).expect("serializable").body;
        let location = self
            .bodies
            .save(unit.message_id(), &body)
            .await
            .expect("body stored");

        let mut record = MessageRecord::for_unit(Direction::Out, unit, self.clock.now())
            .with_operation(operation)
            .with_mep(pmode.mep)
            .with_pmode(pmode.id.clone(), to_snapshot(pmode).expect("snapshot"));
        if let MessageUnit::User(user) = unit {
            record.mpc = Some(user.mpc.clone());
        }
        record.message_location = Some(location);
        self.ledger.insert(record).await.expect("inserted").record_id
    }

    /// Store an inbound message record without a body
    pub async fn store_in(&self, unit: &MessageUnit, operation: Operation) -> RecordId {
        let record = MessageRecord::for_unit(Direction::In, unit, self.clock.now()).with_operation(operation);
        self.ledger.insert(record).await.expect("inserted").record_id
    }

    pub async fn out_record(&self, record_id: RecordId) -> MessageRecord {
        self.ledger
            .get_record(Direction::Out, record_id)
            .await
            .expect("ledger available")
            .expect("record exists")
    }

    pub async fn in_record(&self, record_id: RecordId) -> MessageRecord {
        self.ledger
            .get_record(Direction::In, record_id)
            .await
            .expect("ledger available")
            .expect("record exists")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

// ----------------------------------------------------------------------------
// Failing Ledger
// ----------------------------------------------------------------------------

/// Ledger that fails message inserts or record updates on demand
pub struct FlakyLedger {
    inner: Arc<InMemoryLedger>,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: Arc<InMemoryLedger>) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> LedgerError {
        LedgerError::Unavailable {
            reason: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn find_existing_ids(&self, direction: Direction, ids: &[String]) -> LedgerResult<HashSet<String>> {
        self.inner.find_existing_ids(direction, ids).await
    }

    async fn find_existing_refs(&self, direction: Direction, refs: &[String]) -> LedgerResult<HashSet<String>> {
        self.inner.find_existing_refs(direction, refs).await
    }

    async fn insert(&self, record: MessageRecord) -> LedgerResult<Inserted> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.insert(record).await
    }

    async fn update_by_message_id(
        &self,
        direction: Direction,
        ebms_message_id: &str,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<usize> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_by_message_id(direction, ebms_message_id, mutator).await
    }

    async fn update_record(
        &self,
        direction: Direction,
        record_id: RecordId,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<bool> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_record(direction, record_id, mutator).await
    }

    async fn try_transition(
        &self,
        direction: Direction,
        record_id: RecordId,
        from: &[Operation],
        to: Operation,
    ) -> LedgerResult<bool> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.try_transition(direction, record_id, from, to).await
    }

    async fn get_pmode_snapshot(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Option<String>> {
        self.inner.get_pmode_snapshot(direction, ebms_message_id).await
    }

    async fn latest_out_message(&self, ebms_message_id: &str) -> LedgerResult<Option<MessageRecord>> {
        self.inner.latest_out_message(ebms_message_id).await
    }

    async fn get_record(&self, direction: Direction, record_id: RecordId) -> LedgerResult<Option<MessageRecord>> {
        self.inner.get_record(direction, record_id).await
    }

    async fn find_by_message_id(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Vec<MessageRecord>> {
        self.inner.find_by_message_id(direction, ebms_message_id).await
    }

    async fn find_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>> {
        self.inner.find_by_operation(direction, operation, limit).await
    }

    async fn find_pull_candidates(&self, mpc: &str, limit: usize) -> LedgerResult<Vec<MessageRecord>> {
        self.inner.find_pull_candidates(mpc, limit).await
    }

    async fn find_push_candidates(&self, limit: usize) -> LedgerResult<Vec<MessageRecord>> {
        self.inner.find_push_candidates(limit).await
    }

    async fn find_piggyback_candidates(
        &self,
        mpc: &str,
        url: Option<&str>,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>> {
        self.inner.find_piggyback_candidates(mpc, url, limit).await
    }

    async fn insert_exception(&self, record: ExceptionRecord) -> LedgerResult<ExceptionId> {
        self.inner.insert_exception(record).await
    }

    async fn update_exception(&self, exception_id: ExceptionId, mutator: ExceptionMutator<'_>) -> LedgerResult<bool> {
        self.inner.update_exception(exception_id, mutator).await
    }

    async fn get_exception(&self, exception_id: ExceptionId) -> LedgerResult<Option<ExceptionRecord>> {
        self.inner.get_exception(exception_id).await
    }

    async fn find_exceptions_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<ExceptionRecord>> {
        self.inner.find_exceptions_by_operation(direction, operation, limit).await
    }

    async fn insert_reception_awareness(&self, record: ReceptionAwareness) -> LedgerResult<u64> {
        self.inner.insert_reception_awareness(record).await
    }

    async fn pending_reception_awareness(&self) -> LedgerResult<Vec<ReceptionAwareness>> {
        self.inner.pending_reception_awareness().await
    }

    async fn reception_awareness_for(&self, out_record: RecordId) -> LedgerResult<Option<ReceptionAwareness>> {
        self.inner.reception_awareness_for(out_record).await
    }

    async fn update_reception_awareness(&self, id: u64, mutator: ReceptionAwarenessMutator<'_>) -> LedgerResult<bool> {
        self.inner.update_reception_awareness(id, mutator).await
    }

    async fn insert_retry_reliability(&self, record: RetryReliability) -> LedgerResult<u64> {
        self.inner.insert_retry_reliability(record).await
    }

    async fn retry_reliability_for(&self, owner: RetryOwner) -> LedgerResult<Option<RetryReliability>> {
        self.inner.retry_reliability_for(owner).await
    }

    async fn pending_retry_reliabilities(&self) -> LedgerResult<Vec<RetryReliability>> {
        self.inner.pending_retry_reliabilities().await
    }

    async fn update_retry_reliability(&self, id: u64, mutator: RetryReliabilityMutator<'_>) -> LedgerResult<bool> {
        self.inner.update_retry_reliability(id, mutator).await
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub fn user_message(id: &str) -> UserMessage {
    let mut user = UserMessage::new(
        Party::new("Sender", "org:sender"),
        Party::new("Receiver", "org:receiver"),
        Service::new("urn:services:invoice"),
        "Submit",
    );
    user.message_id = id.to_string();
    user
}

pub fn user_message_on(id: &str, mpc: &str) -> UserMessage {
    let mut user = user_message(id);
    user.mpc = mpc.to_string();
    user
}

pub fn push_pmode(id: &str) -> SendingPMode {
    let mut pmode = SendingPMode::new(id);
    pmode.push_configuration = Some(PushConfiguration {
        url: PARTNER_URL.to_string(),
        ..PushConfiguration::default()
    });
    pmode
}

/// Push PMode with reception awareness and producer notification of errors
pub fn aware_pmode(id: &str, retry_count: u32, retry_interval: Duration) -> SendingPMode {
    let mut pmode = push_pmode(id);
    pmode.reliability.reception_awareness = ReceptionAwarenessConfig::enabled(retry_count, retry_interval);
    pmode.error_handling.notify_message_producer = true;
    pmode.error_handling.reliability = RetryConfig::fixed(2, Duration::from_secs(1));
    pmode
}

pub fn pull_pmode(id: &str, mpc: &str) -> SendingPMode {
    let mut pmode = push_pmode(id);
    pmode.mep = Mep::Pull;
    pmode.message_packaging.mpc = Some(mpc.to_string());
    pmode
}

pub fn default_mpc() -> String {
    DEFAULT_MPC.to_string()
}
