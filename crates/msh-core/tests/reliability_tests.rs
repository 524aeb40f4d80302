//! Reception awareness and retry/backoff scenarios
//!
//! Time is driven by a manual clock; every deadline is evaluated at sweep
//! time against stored timestamps.

mod test_utils;

use msh_core::ledger::{ExceptionRecord, Ledger, MessageRecord, Operation, RetryOwner, RetryReliability, RetryType, Status};
use msh_core::message::{As4Message, ErrorCode, MessageUnit, SignalMessage};
use msh_core::pmode::RetryConfig;
use msh_core::reliability::{
    DeliverCallbacks, NotifyExceptionCallbacks, ReceptionAwarenessEngine, RetryDecision, RetryEngine,
    SendCallbacks, SweepReport,
};
use msh_core::types::{Direction, RecordId};
use msh_core::SendResult;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Simulate one push attempt the way the send step records it
async fn simulate_send(env: &TestEnv, engine: &ReceptionAwarenessEngine, record_id: RecordId, pmode: &msh_core::SendingPMode) {
    let claimed = env
        .ledger
        .try_transition(Direction::Out, record_id, &[Operation::ToBeSent], Operation::Sending)
        .await
        .unwrap();
    assert!(claimed, "record should be claimable for sending");

    let message_id = env.out_record(record_id).await.ebms_message_id;
    engine.record_send_attempt(record_id, &message_id, pmode).await.unwrap();
    env.ledger
        .update_record(Direction::Out, record_id, &mut |r| {
            r.operation = Operation::Sent;
            r.status = Status::Sent;
        })
        .await
        .unwrap();
}

// ----------------------------------------------------------------------------
// Reception Awareness
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unanswered_message_is_resent_then_dead_lettered() {
    let env = TestEnv::new();
    let engine = ReceptionAwarenessEngine::new(env.ledger(), env.time_source());
    let pmode = aware_pmode("push-aware", 3, Duration::from_secs(5));
    let message = As4Message::from_user_message(user_message("u1@test"));

    let record_id = env.store_out(&message, &pmode, Operation::ToBeSent).await;
    simulate_send(&env, &engine, record_id, &pmode).await;

    for resend in 1..=3 {
        env.advance(Duration::from_secs(4));
        assert!(engine.sweep().await.unwrap().is_empty(), "not due yet");

        env.advance(Duration::from_secs(1));
        let report = engine.sweep().await.unwrap();
        assert_eq!(report.resends, 1, "resend {} scheduled", resend);
        assert_eq!(env.out_record(record_id).await.operation, Operation::ToBeSent);

        simulate_send(&env, &engine, record_id, &pmode).await;
    }

    let awareness = env.ledger.reception_awareness_for(record_id).await.unwrap().unwrap();
    assert_eq!(awareness.current_retry_count, 3);

    env.advance(Duration::from_secs(5));
    let report = engine.sweep().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            completed: 0,
            resends: 0,
            dead_lettered: 1
        }
    );

    let out = env.out_record(record_id).await;
    assert_eq!(out.operation, Operation::DeadLettered);
    assert_eq!(out.status, Status::Exception);

    let errors: Vec<MessageRecord> = env
        .ledger
        .records(Direction::In)
        .into_iter()
        .filter(|r| r.ebms_ref_to_message_id.as_deref() == Some("u1@test"))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, Operation::ToBeNotified);
    assert_eq!(errors[0].pmode_id.as_deref(), Some("push-aware"));

    let rr = env
        .ledger
        .retry_reliability_for(RetryOwner::InMessage(errors[0].record_id))
        .await
        .unwrap();
    assert!(rr.is_some(), "notification of the synthesized error is retried");

    // Nothing left to do afterwards
    env.advance(Duration::from_secs(60));
    assert!(engine.sweep().await.unwrap().is_empty());
}

fn missing_receipt_errors(env: &TestEnv, message_id: &str) -> Vec<MessageRecord> {
    env.ledger
        .records(Direction::In)
        .into_iter()
        .filter(|r| r.ebms_ref_to_message_id.as_deref() == Some(message_id))
        .collect()
}

#[tokio::test]
async fn test_failed_error_insert_keeps_message_for_next_sweep() {
    let env = TestEnv::new();
    let flaky = Arc::new(FlakyLedger::new(env.ledger.clone()));
    let engine = ReceptionAwarenessEngine::new(flaky.clone(), env.time_source());
    let pmode = aware_pmode("push-aware", 0, Duration::from_secs(5));

    let record_id = env
        .store_out(&As4Message::from_user_message(user_message("u1@test")), &pmode, Operation::ToBeSent)
        .await;
    simulate_send(&env, &engine, record_id, &pmode).await;
    env.advance(Duration::from_secs(5));

    flaky.fail_inserts(true);
    assert!(engine.sweep().await.is_err());
    assert_eq!(env.out_record(record_id).await.operation, Operation::Sent);
    assert!(missing_receipt_errors(&env, "u1@test").is_empty());

    flaky.fail_inserts(false);
    let report = engine.sweep().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(env.out_record(record_id).await.operation, Operation::DeadLettered);
    assert_eq!(missing_receipt_errors(&env, "u1@test").len(), 1);
}

#[tokio::test]
async fn test_failed_dead_letter_update_does_not_duplicate_error() {
    let env = TestEnv::new();
    let flaky = Arc::new(FlakyLedger::new(env.ledger.clone()));
    let engine = ReceptionAwarenessEngine::new(flaky.clone(), env.time_source());
    let pmode = aware_pmode("push-aware", 0, Duration::from_secs(5));

    let record_id = env
        .store_out(&As4Message::from_user_message(user_message("u2@test")), &pmode, Operation::ToBeSent)
        .await;
    simulate_send(&env, &engine, record_id, &pmode).await;
    env.advance(Duration::from_secs(5));

    flaky.fail_updates(true);
    assert!(engine.sweep().await.is_err());
    assert_eq!(missing_receipt_errors(&env, "u2@test").len(), 1);

    flaky.fail_updates(false);
    assert_eq!(engine.sweep().await.unwrap().dead_lettered, 1);
    assert_eq!(env.out_record(record_id).await.operation, Operation::DeadLettered);

    let errors = missing_receipt_errors(&env, "u2@test");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message_type, msh_core::types::MessageType::Error);
    assert!(engine.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_answered_message_is_never_resent() {
    let env = TestEnv::new();
    let engine = ReceptionAwarenessEngine::new(env.ledger(), env.time_source());
    let pmode = aware_pmode("push-aware", 3, Duration::from_secs(5));
    let message = As4Message::from_user_message(user_message("u2@test"));

    let record_id = env.store_out(&message, &pmode, Operation::ToBeSent).await;
    simulate_send(&env, &engine, record_id, &pmode).await;

    // Receipt arrives before the first deadline
    env.ledger
        .update_by_message_id(Direction::Out, "u2@test", &mut |r| r.status = Status::Ack)
        .await
        .unwrap();

    env.advance(Duration::from_secs(5));
    let report = engine.sweep().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.resends, 0);

    for _ in 0..5 {
        env.advance(Duration::from_secs(5));
        assert!(engine.sweep().await.unwrap().is_empty());
    }
    assert_eq!(env.out_record(record_id).await.operation, Operation::Sent);
}

#[tokio::test]
async fn test_in_flight_send_is_not_resent() {
    let env = TestEnv::new();
    let engine = ReceptionAwarenessEngine::new(env.ledger(), env.time_source());
    let pmode = aware_pmode("push-aware", 3, Duration::from_secs(5));
    let message = As4Message::from_user_message(user_message("u3@test"));

    let record_id = env.store_out(&message, &pmode, Operation::ToBeSent).await;
    env.ledger
        .try_transition(Direction::Out, record_id, &[Operation::ToBeSent], Operation::Sending)
        .await
        .unwrap();
    engine
        .record_send_attempt(record_id, "u3@test", &pmode)
        .await
        .unwrap();

    env.advance(Duration::from_secs(30));
    let report = engine.sweep().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(env.out_record(record_id).await.operation, Operation::Sending);
}

#[tokio::test]
async fn test_retryable_send_failure_is_picked_up_by_sweep() {
    let env = TestEnv::new();
    let engine = ReceptionAwarenessEngine::new(env.ledger(), env.time_source());
    let pmode = aware_pmode("push-aware", 1, Duration::from_secs(5));
    let message = As4Message::from_user_message(user_message("u4@test"));

    let record_id = env.store_out(&message, &pmode, Operation::ToBeSent).await;
    env.ledger
        .try_transition(Direction::Out, record_id, &[Operation::ToBeSent], Operation::Sending)
        .await
        .unwrap();
    engine.record_send_attempt(record_id, "u4@test", &pmode).await.unwrap();
    env.ledger
        .update_record(Direction::Out, record_id, &mut |r| r.operation = Operation::ToBeRetried)
        .await
        .unwrap();

    env.advance(Duration::from_secs(5));
    assert_eq!(engine.sweep().await.unwrap().resends, 1);
    assert_eq!(env.out_record(record_id).await.operation, Operation::ToBeSent);
}

// ----------------------------------------------------------------------------
// Retry / Backoff
// ----------------------------------------------------------------------------

async fn delivering_record(env: &TestEnv, id: &str, retry: Option<RetryConfig>) -> RecordId {
    let unit = MessageUnit::User(user_message(id));
    let record_id = env.store_in(&unit, Operation::ToBeDelivered).await;
    if let Some(config) = retry {
        let rr = RetryReliability::from_config(RetryOwner::InMessage(record_id), RetryType::Delivery, &config);
        env.ledger.insert_retry_reliability(rr).await.unwrap();
    }
    assert!(env
        .ledger
        .try_transition(Direction::In, record_id, &[Operation::ToBeDelivered], Operation::Delivering)
        .await
        .unwrap());
    record_id
}

#[tokio::test]
async fn test_delivery_success_completes_record() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let record_id = delivering_record(&env, "i1@test", Some(RetryConfig::fixed(3, Duration::from_secs(1)))).await;

    let decision = engine
        .handle(RetryOwner::InMessage(record_id), SendResult::Success, &DeliverCallbacks)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::Completed);

    let record = env.in_record(record_id).await;
    assert_eq!(record.operation, Operation::Delivered);
    assert_eq!(record.status, Status::Delivered);
    assert!(env.ledger.pending_retry_reliabilities().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_dead_letters_on_last_failure() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let max_retries = 2;
    let owner_id = delivering_record(
        &env,
        "r1@test",
        Some(RetryConfig::fixed(max_retries, Duration::from_secs(1))),
    )
    .await;
    let owner = RetryOwner::InMessage(owner_id);

    for attempt in 1..=max_retries {
        let decision = engine
            .handle(owner, SendResult::RetryableFail, &DeliverCallbacks)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Retry { attempt });
        assert_eq!(env.in_record(owner_id).await.operation, Operation::ToBeRetried);

        // Backoff not yet elapsed
        assert_eq!(engine.sweep().await.unwrap().requeued, 0);
        env.advance(Duration::from_secs(1));
        assert_eq!(engine.sweep().await.unwrap().requeued, 1);
        assert_eq!(env.in_record(owner_id).await.operation, Operation::ToBeDelivered);

        assert!(env
            .ledger
            .try_transition(Direction::In, owner_id, &[Operation::ToBeDelivered], Operation::Delivering)
            .await
            .unwrap());
    }

    let decision = engine
        .handle(owner, SendResult::RetryableFail, &DeliverCallbacks)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered);

    let record = env.in_record(owner_id).await;
    assert_eq!(record.operation, Operation::DeadLettered);
    assert_eq!(record.status, Status::Exception);
    assert!(env.ledger.pending_retry_reliabilities().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backoff_multiplier_delays_later_retries() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let config = RetryConfig {
        is_enabled: true,
        retry_count: 5,
        retry_interval_ms: 1_000,
        backoff_multiplier: 2.0,
        max_retry_interval_ms: 60_000,
    };
    let owner_id = delivering_record(&env, "b1@test", Some(config)).await;
    let owner = RetryOwner::InMessage(owner_id);

    // First retry after 1s
    engine.handle(owner, SendResult::RetryableFail, &DeliverCallbacks).await.unwrap();
    env.advance(Duration::from_secs(1));
    assert_eq!(engine.sweep().await.unwrap().requeued, 1);
    env.ledger
        .try_transition(Direction::In, owner_id, &[Operation::ToBeDelivered], Operation::Delivering)
        .await
        .unwrap();

    // Second retry after 2s
    engine.handle(owner, SendResult::RetryableFail, &DeliverCallbacks).await.unwrap();
    env.advance(Duration::from_secs(1));
    assert_eq!(engine.sweep().await.unwrap().requeued, 0);
    env.advance(Duration::from_secs(1));
    assert_eq!(engine.sweep().await.unwrap().requeued, 1);
}

#[tokio::test]
async fn test_fatal_failure_dead_letters_immediately() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let owner_id = delivering_record(&env, "f1@test", Some(RetryConfig::fixed(5, Duration::from_secs(1)))).await;

    let decision = engine
        .handle(RetryOwner::InMessage(owner_id), SendResult::FatalFail, &DeliverCallbacks)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered);
    assert_eq!(env.in_record(owner_id).await.operation, Operation::DeadLettered);
}

#[tokio::test]
async fn test_retryable_failure_without_reliability_dead_letters() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let owner_id = delivering_record(&env, "n1@test", None).await;

    let decision = engine
        .handle(RetryOwner::InMessage(owner_id), SendResult::RetryableFail, &DeliverCallbacks)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered);
}

#[tokio::test]
async fn test_failed_send_records_out_exception() {
    let env = TestEnv::new();
    let engine = RetryEngine::new(env.ledger(), env.time_source());
    let mut pmode = push_pmode("push-plain");
    pmode.exception_handling.notify_message_producer = true;
    let pmode = Arc::new(pmode);

    let message = As4Message::from_user_message(user_message("s1@test"));
    let record_id = env.store_out(&message, &pmode, Operation::ToBeSent).await;
    env.ledger
        .try_transition(Direction::Out, record_id, &[Operation::ToBeSent], Operation::Sending)
        .await
        .unwrap();

    let callbacks = SendCallbacks::new(Some(pmode.clone()), env.time_source());
    let decision = engine
        .handle(RetryOwner::OutMessage(record_id), SendResult::FatalFail, &callbacks)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered);

    let exceptions: Vec<ExceptionRecord> = env.ledger.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].direction, Direction::Out);
    assert_eq!(exceptions[0].ebms_ref_to_message_id.as_deref(), Some("s1@test"));
    assert_eq!(exceptions[0].operation, Operation::ToBeNotified);

    // Notify the exception and complete it
    let exception_id = exceptions[0].exception_id;
    env.ledger
        .update_exception(exception_id, &mut |r| r.operation = Operation::Notifying)
        .await
        .unwrap();
    engine
        .handle(RetryOwner::OutException(exception_id), SendResult::Success, &NotifyExceptionCallbacks)
        .await
        .unwrap();
    let stored = env.ledger.get_exception(exception_id).await.unwrap().unwrap();
    assert_eq!(stored.operation, Operation::Notified);
}

// ----------------------------------------------------------------------------
// Duplicate Detection
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receptions_yield_one_original() {
    let env = TestEnv::new();
    let unit = MessageUnit::User(user_message("dup@test"));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = env.ledger.clone();
        let unit = unit.clone();
        let now = msh_core::Timestamp::new(0);
        handles.push(tokio::spawn(async move {
            ledger
                .insert(MessageRecord::for_unit(Direction::In, &unit, now))
                .await
                .unwrap()
        }));
    }

    let mut originals = 0;
    for handle in handles {
        if !handle.await.unwrap().is_duplicate {
            originals += 1;
        }
    }
    assert_eq!(originals, 1);
    assert_eq!(env.ledger.records(Direction::In).len(), 16);
}

#[tokio::test]
async fn test_duplicate_error_signal_still_nacks() {
    let env = TestEnv::new();
    let pmode = push_pmode("push-plain");
    let message = As4Message::from_user_message(user_message("e1@test"));
    env.store_out(&message, &pmode, Operation::Sent).await;

    let error = SignalMessage::error_for(
        Some("e1@test".to_string()),
        ErrorCode::DeliveryFailure,
        "rejected",
        msh_core::Timestamp::new(0),
    );
    env.store_in(&MessageUnit::Signal(error.clone()), Operation::Created).await;

    let classification = msh_core::duplicates::classify_duplicates(
        env.ledger.as_ref(),
        &As4Message::from_signal(error.clone()),
    )
    .await
    .unwrap();
    assert_eq!(classification.get("e1@test"), Some(&true));

    let status = msh_core::duplicates::answer_status(&error).unwrap();
    assert_eq!(status, Status::Nack);
}
