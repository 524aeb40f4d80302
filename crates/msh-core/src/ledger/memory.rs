//! In-memory ledger
//!
//! `DashMap`-backed implementation of [`Ledger`] and [`MessageBodyStore`].
//! Per-record updates run under the map's entry lock, which gives the same
//! read-mutate-validate-write atomicity a relational implementation gets from
//! a conditional `UPDATE`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{
    ExceptionMutator, ExceptionRecord, Inserted, Ledger, LedgerResult, MessageBodyStore, MessageRecord, Operation,
    ReceptionAwareness, ReceptionAwarenessMutator, RecordMutator, ReliabilityStatus, RetryOwner, RetryReliability,
    RetryReliabilityMutator,
};
use crate::errors::LedgerError;
use crate::types::{Direction, ExceptionId, Mep, MessageType, RecordId, SystemTimeSource, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// In-Memory Ledger
// ----------------------------------------------------------------------------

/// Ledger kept entirely in process memory
pub struct InMemoryLedger {
    time_source: Arc<dyn TimeSource>,
    next_id: AtomicU64,
    in_messages: DashMap<RecordId, MessageRecord>,
    out_messages: DashMap<RecordId, MessageRecord>,
    /// (direction, ebMS id) -> records carrying that id, in insertion order
    id_index: DashMap<(Direction, String), Vec<RecordId>>,
    exceptions: DashMap<ExceptionId, ExceptionRecord>,
    awareness: DashMap<u64, ReceptionAwareness>,
    retries: DashMap<u64, RetryReliability>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource::new()))
    }
}

impl InMemoryLedger {
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            time_source,
            next_id: AtomicU64::new(1),
            in_messages: DashMap::new(),
            out_messages: DashMap::new(),
            id_index: DashMap::new(),
            exceptions: DashMap::new(),
            awareness: DashMap::new(),
            retries: DashMap::new(),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn table(&self, direction: Direction) -> &DashMap<RecordId, MessageRecord> {
        match direction {
            Direction::In => &self.in_messages,
            Direction::Out => &self.out_messages,
        }
    }

    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    /// Snapshot of every message record in one direction, oldest first
    pub fn records(&self, direction: Direction) -> Vec<MessageRecord> {
        let mut records: Vec<MessageRecord> = self
            .table(direction)
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.record_id);
        records
    }

    /// Snapshot of every exception record, oldest first
    pub fn exceptions(&self) -> Vec<ExceptionRecord> {
        let mut records: Vec<ExceptionRecord> =
            self.exceptions.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|r| r.exception_id);
        records
    }

    /// Apply a mutator to one record, rejecting illegal operation changes
    fn apply(
        &self,
        direction: Direction,
        record_id: RecordId,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<bool> {
        let mut entry = match self.table(direction).get_mut(&record_id) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let mut candidate = entry.clone();
        mutator(&mut candidate);

        if candidate.operation != entry.operation && !entry.operation.can_transition_to(candidate.operation) {
            return Err(LedgerError::IllegalTransition {
                message_id: entry.ebms_message_id.clone(),
                from: format!("{:?}", entry.operation),
                to: format!("{:?}", candidate.operation),
            });
        }

        // Identity fields are owned by the ledger
        candidate.record_id = entry.record_id;
        candidate.direction = entry.direction;
        candidate.ebms_message_id = entry.ebms_message_id.clone();
        candidate.insertion_time = entry.insertion_time;
        candidate.modification_time = self.now();

        trace!(
            record = %record_id,
            operation = ?candidate.operation,
            status = ?candidate.status,
            "Record updated"
        );
        *entry = candidate;
        Ok(true)
    }

    /// Matching records of one direction, oldest first; the limit applies after filtering
    fn find_where<F>(&self, direction: Direction, limit: usize, predicate: F) -> Vec<MessageRecord>
    where
        F: Fn(&MessageRecord) -> bool,
    {
        let mut records: Vec<MessageRecord> = self
            .table(direction)
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| (r.insertion_time, r.record_id));
        records.truncate(limit);
        records
    }

    /// Whether a user message with this id was received on `mpc`
    fn received_on_mpc(&self, ebms_message_id: &str, mpc: &str) -> bool {
        self.index_lookup(Direction::In, ebms_message_id).iter().any(|rid| {
            self.in_messages
                .get(rid)
                .map_or(false, |r| r.message_type == MessageType::UserMessage && r.mpc.as_deref() == Some(mpc))
        })
    }

    fn index_lookup(&self, direction: Direction, ebms_message_id: &str) -> Vec<RecordId> {
        self.id_index
            .get(&(direction, ebms_message_id.to_string()))
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn find_existing_ids(&self, direction: Direction, ids: &[String]) -> LedgerResult<HashSet<String>> {
        let table = self.table(direction);
        let existing = ids
            .iter()
            .filter(|id| {
                self.index_lookup(direction, id)
                    .iter()
                    .any(|rid| table.get(rid).map_or(false, |r| !r.is_duplicate))
            })
            .cloned()
            .collect();
        Ok(existing)
    }

    async fn find_existing_refs(&self, direction: Direction, refs: &[String]) -> LedgerResult<HashSet<String>> {
        let wanted: HashSet<&str> = refs.iter().map(String::as_str).collect();
        let existing = self
            .table(direction)
            .iter()
            .filter(|entry| entry.message_type.is_receipt_or_error() && !entry.is_duplicate)
            .filter_map(|entry| entry.ebms_ref_to_message_id.clone())
            .filter(|ref_to| wanted.contains(ref_to.as_str()))
            .collect();
        Ok(existing)
    }

    async fn insert(&self, mut record: MessageRecord) -> LedgerResult<Inserted> {
        let direction = record.direction;
        let table = self.table(direction);

        // The index entry lock serializes inserts of the same ebMS id
        let mut ids = self
            .id_index
            .entry((direction, record.ebms_message_id.clone()))
            .or_default();

        let original_exists = ids
            .iter()
            .any(|rid| table.get(rid).map_or(false, |r| !r.is_duplicate));
        if original_exists && !record.is_duplicate {
            // Lost the race against a concurrent original: duplicates never start work
            record.is_duplicate = true;
            record.operation = Operation::Created;
        }

        let record_id = RecordId::new(self.allocate_id());
        let now = self.now();
        record.record_id = record_id;
        record.insertion_time = now;
        record.modification_time = now;
        let is_duplicate = record.is_duplicate;

        debug!(
            record = %record_id,
            direction = %direction,
            message_id = %record.ebms_message_id,
            message_type = ?record.message_type,
            operation = ?record.operation,
            is_duplicate,
            "Record inserted"
        );

        table.insert(record_id, record);
        ids.push(record_id);

        Ok(Inserted {
            record_id,
            is_duplicate,
        })
    }

    async fn update_by_message_id(
        &self,
        direction: Direction,
        ebms_message_id: &str,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<usize> {
        let mut updated = 0;
        for record_id in self.index_lookup(direction, ebms_message_id) {
            if self.apply(direction, record_id, &mut *mutator)? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_record(
        &self,
        direction: Direction,
        record_id: RecordId,
        mutator: RecordMutator<'_>,
    ) -> LedgerResult<bool> {
        self.apply(direction, record_id, mutator)
    }

    async fn try_transition(
        &self,
        direction: Direction,
        record_id: RecordId,
        from: &[Operation],
        to: Operation,
    ) -> LedgerResult<bool> {
        let mut entry = self
            .table(direction)
            .get_mut(&record_id)
            .ok_or(LedgerError::RecordNotFound { direction, record_id })?;

        if !from.contains(&entry.operation) || !entry.operation.can_transition_to(to) {
            trace!(record = %record_id, current = ?entry.operation, wanted = ?to, "Claim lost");
            return Ok(false);
        }

        entry.operation = to;
        entry.modification_time = self.now();
        Ok(true)
    }

    async fn get_pmode_snapshot(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Option<String>> {
        let table = self.table(direction);
        let snapshot = self
            .index_lookup(direction, ebms_message_id)
            .iter()
            .filter_map(|rid| table.get(rid).map(|r| r.value().clone()))
            .find(|r| !r.is_duplicate)
            .and_then(|r| r.pmode_snapshot);
        Ok(snapshot)
    }

    async fn latest_out_message(&self, ebms_message_id: &str) -> LedgerResult<Option<MessageRecord>> {
        let latest = self
            .index_lookup(Direction::Out, ebms_message_id)
            .iter()
            .filter_map(|rid| self.out_messages.get(rid).map(|r| r.value().clone()))
            .filter(|r| !r.intermediary)
            .max_by_key(|r| (r.modification_time, r.record_id));
        Ok(latest)
    }

    async fn get_record(&self, direction: Direction, record_id: RecordId) -> LedgerResult<Option<MessageRecord>> {
        Ok(self.table(direction).get(&record_id).map(|r| r.value().clone()))
    }

    async fn find_by_message_id(&self, direction: Direction, ebms_message_id: &str) -> LedgerResult<Vec<MessageRecord>> {
        let table = self.table(direction);
        Ok(self
            .index_lookup(direction, ebms_message_id)
            .iter()
            .filter_map(|rid| table.get(rid).map(|r| r.value().clone()))
            .collect())
    }

    async fn find_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>> {
        Ok(self.find_where(direction, limit, |r| r.operation == operation))
    }

    async fn find_pull_candidates(&self, mpc: &str, limit: usize) -> LedgerResult<Vec<MessageRecord>> {
        Ok(self.find_where(Direction::Out, limit, |r| {
            r.operation == Operation::ToBeSent
                && r.mep == Mep::Pull
                && r.message_type == MessageType::UserMessage
                && r.mpc.as_deref() == Some(mpc)
        }))
    }

    async fn find_push_candidates(&self, limit: usize) -> LedgerResult<Vec<MessageRecord>> {
        Ok(self.find_where(Direction::Out, limit, |r| {
            r.operation == Operation::ToBeSent && !(r.mep == Mep::Pull && r.message_type == MessageType::UserMessage)
        }))
    }

    async fn find_piggyback_candidates(
        &self,
        mpc: &str,
        url: Option<&str>,
        limit: usize,
    ) -> LedgerResult<Vec<MessageRecord>> {
        Ok(self.find_where(Direction::Out, limit, |r| {
            let url_matches = match (r.url.as_deref(), url) {
                (None, _) => true,
                (Some(target), Some(url)) => target == url,
                (Some(_), None) => false,
            };
            r.operation == Operation::ToBePiggyBacked
                && r.message_type.is_receipt_or_error()
                && url_matches
                && r.ebms_ref_to_message_id
                    .as_deref()
                    .map_or(false, |ref_to| self.received_on_mpc(ref_to, mpc))
        }))
    }

    async fn insert_exception(&self, mut record: ExceptionRecord) -> LedgerResult<ExceptionId> {
        let exception_id = ExceptionId::new(self.allocate_id());
        let now = self.now();
        record.exception_id = exception_id;
        record.insertion_time = now;
        record.modification_time = now;
        debug!(
            exception = %exception_id,
            direction = %record.direction,
            ref_to = ?record.ebms_ref_to_message_id,
            "Exception recorded"
        );
        self.exceptions.insert(exception_id, record);
        Ok(exception_id)
    }

    async fn update_exception(
        &self,
        exception_id: ExceptionId,
        mutator: ExceptionMutator<'_>,
    ) -> LedgerResult<bool> {
        let mut entry = match self.exceptions.get_mut(&exception_id) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let mut candidate = entry.clone();
        mutator(&mut candidate);
        if candidate.operation != entry.operation && !entry.operation.can_transition_to(candidate.operation) {
            return Err(LedgerError::IllegalTransition {
                message_id: exception_id.to_string(),
                from: format!("{:?}", entry.operation),
                to: format!("{:?}", candidate.operation),
            });
        }
        candidate.exception_id = exception_id;
        candidate.modification_time = self.now();
        *entry = candidate;
        Ok(true)
    }

    async fn get_exception(&self, exception_id: ExceptionId) -> LedgerResult<Option<ExceptionRecord>> {
        Ok(self.exceptions.get(&exception_id).map(|r| r.value().clone()))
    }

    async fn find_exceptions_by_operation(
        &self,
        direction: Direction,
        operation: Operation,
        limit: usize,
    ) -> LedgerResult<Vec<ExceptionRecord>> {
        let mut records: Vec<ExceptionRecord> = self
            .exceptions
            .iter()
            .filter(|entry| entry.direction == direction && entry.operation == operation)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.exception_id);
        records.truncate(limit);
        Ok(records)
    }

    async fn insert_reception_awareness(&self, mut record: ReceptionAwareness) -> LedgerResult<u64> {
        let out_record = record.ref_to_out_message_id;
        if self
            .awareness
            .iter()
            .any(|entry| entry.ref_to_out_message_id == out_record)
        {
            return Err(LedgerError::Conflict {
                reason: format!("reception awareness already tracked for {}", out_record),
            });
        }
        let id = self.allocate_id();
        record.id = id;
        self.awareness.insert(id, record);
        Ok(id)
    }

    async fn pending_reception_awareness(&self) -> LedgerResult<Vec<ReceptionAwareness>> {
        let mut pending: Vec<ReceptionAwareness> = self
            .awareness
            .iter()
            .filter(|entry| entry.status == ReliabilityStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|r| r.id);
        Ok(pending)
    }

    async fn reception_awareness_for(&self, out_record: RecordId) -> LedgerResult<Option<ReceptionAwareness>> {
        Ok(self
            .awareness
            .iter()
            .find(|entry| entry.ref_to_out_message_id == out_record)
            .map(|entry| entry.value().clone()))
    }

    async fn update_reception_awareness(
        &self,
        id: u64,
        mutator: ReceptionAwarenessMutator<'_>,
    ) -> LedgerResult<bool> {
        match self.awareness.get_mut(&id) {
            Some(mut entry) => {
                mutator(entry.value_mut());
                entry.id = id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_retry_reliability(&self, mut record: RetryReliability) -> LedgerResult<u64> {
        let owner = record.owner;
        if self.retries.iter().any(|entry| entry.owner == owner) {
            return Err(LedgerError::Conflict {
                reason: format!("retry reliability already exists for {:?}", owner),
            });
        }
        let id = self.allocate_id();
        record.id = id;
        self.retries.insert(id, record);
        Ok(id)
    }

    async fn retry_reliability_for(&self, owner: RetryOwner) -> LedgerResult<Option<RetryReliability>> {
        Ok(self
            .retries
            .iter()
            .find(|entry| entry.owner == owner)
            .map(|entry| entry.value().clone()))
    }

    async fn pending_retry_reliabilities(&self) -> LedgerResult<Vec<RetryReliability>> {
        let mut pending: Vec<RetryReliability> = self
            .retries
            .iter()
            .filter(|entry| entry.status == ReliabilityStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|r| r.id);
        Ok(pending)
    }

    async fn update_retry_reliability(
        &self,
        id: u64,
        mutator: RetryReliabilityMutator<'_>,
    ) -> LedgerResult<bool> {
        let mut entry = match self.retries.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let mut candidate = entry.clone();
        mutator(&mut candidate);
        if entry.status == ReliabilityStatus::Completed && candidate.status != ReliabilityStatus::Completed {
            return Err(LedgerError::Conflict {
                reason: format!("retry reliability {} is already completed", id),
            });
        }
        candidate.id = id;
        candidate.owner = entry.owner;
        *entry = candidate;
        Ok(true)
    }
}

// ----------------------------------------------------------------------------
// In-Memory Body Store
// ----------------------------------------------------------------------------

/// Message body store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryBodyStore {
    next: AtomicU64,
    bodies: DashMap<String, Vec<u8>>,
}

impl InMemoryBodyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBodyStore for InMemoryBodyStore {
    async fn save(&self, ebms_message_id: &str, body: &[u8]) -> LedgerResult<String> {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst);
        let location = format!("memory://{}/{}", sequence, ebms_message_id);
        self.bodies.insert(location.clone(), body.to_vec());
        Ok(location)
    }

    async fn load(&self, location: &str) -> LedgerResult<Vec<u8>> {
        self.bodies
            .get(location)
            .map(|body| body.value().clone())
            .ok_or_else(|| LedgerError::BodyNotFound {
                location: location.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
