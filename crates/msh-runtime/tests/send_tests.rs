//! Send path tests
//!
//! Submitted messages driven through the send agent: push, synchronous
//! receipts, reception awareness resends, retries and dead-lettering.


use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use msh_core::message::{ErrorCode, SignalMessage};
use msh_core::pmode::{ReceptionAwarenessConfig, ReplyPattern, RetryConfig};
use msh_core::{As4Message, Direction, Ledger, MessageType, MshError, Operation, Status};
use msh_runtime::{Agent, AwarenessSweepAgent, RetrySweepAgent, SendAgent};
use test_utils::*;

fn send_agent(msh: &TestMsh) -> SendAgent {
    SendAgent::new(msh.msh.clone(), Duration::from_millis(10), 10)
}

async fn poll(agent: &dyn Agent) -> usize {
    agent.poll_once(&CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn test_submitted_message_is_pushed() {
    let transport = Arc::new(ScriptedTransport::accepting());
    let msh = TestMsh::new(
        config_with(Vec::new(), vec![push_pmode("send-invoice", PARTNER_URL)]),
        transport.clone(),
    );

    let record_id = msh
        .msh
        .submit(user_message("push-1"), "send-invoice")
        .await
        .unwrap();
    let queued = msh.out_record(record_id).await;
    assert_eq!(queued.operation, Operation::ToBeSent);
    assert_eq!(queued.url.as_deref(), Some(PARTNER_URL));

    assert_eq!(poll(&send_agent(&msh)).await, 1);

    let sent = msh.out_record(record_id).await;
    assert_eq!(sent.operation, Operation::Sent);
    assert_eq!(sent.status, Status::Sent);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, PARTNER_URL);
    assert_eq!(transport.sent_messages()[0].primary_message_id(), Some("push-1"));

    // Nothing left to send
    assert_eq!(poll(&send_agent(&msh)).await, 0);
}

#[tokio::test]
async fn test_resubmitting_same_message_id_is_rejected() {
    let msh = TestMsh::new(
        config_with(Vec::new(), vec![push_pmode("send-invoice", PARTNER_URL)]),
        Arc::new(ScriptedTransport::accepting()),
    );
    msh.msh
        .submit(user_message("push-2"), "send-invoice")
        .await
        .unwrap();

    let again = msh.msh.submit(user_message("push-2"), "send-invoice").await;
    assert!(matches!(
        again,
        Err(MshError::ProtocolViolation {
            code: ErrorCode::ValueInconsistent,
            ..
        })
    ));

    let unknown = msh.msh.submit(user_message("push-3"), "no-such-pmode").await;
    assert!(matches!(unknown, Err(MshError::Resolution(_))));
}

#[tokio::test]
async fn test_synchronous_receipt_acknowledges_message() {
    let loopback = Arc::new(LoopbackTransport::default());
    let sender = TestMsh::new(
        config_with(Vec::new(), vec![push_pmode("send-invoice", PARTNER_URL)]),
        loopback.clone(),
    );
    let receiver = TestMsh::new(
        config_with(vec![receiving_pmode("receive-invoice", ReplyPattern::Response)], Vec::new()),
        Arc::new(ScriptedTransport::accepting()),
    );
    loopback.connect(receiver.msh.clone());

    let record_id = sender
        .msh
        .submit(user_message("sync-1"), "send-invoice")
        .await
        .unwrap();
    assert_eq!(poll(&send_agent(&sender)).await, 1);
    assert_eq!(loopback.exchanges(), 1);

    let sent = sender.out_record(record_id).await;
    assert_eq!(sent.operation, Operation::Sent);
    assert_eq!(sent.status, Status::Ack);

    let received = receiver.in_records("sync-1").await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].operation, Operation::ToBeDelivered);

    // The receipt is on record at the sender, not queued for notification
    let receipts = sender
        .ledger
        .find_by_operation(Direction::In, Operation::Created, 10)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].message_type, MessageType::Receipt);
    assert_eq!(receipts[0].ebms_ref_to_message_id.as_deref(), Some("sync-1"));
}

#[tokio::test]
async fn test_unanswered_message_is_resent_then_dead_lettered() {
    let transport = Arc::new(ScriptedTransport::accepting());
    let mut pmode = push_pmode("aware", PARTNER_URL);
    pmode.reliability.reception_awareness = ReceptionAwarenessConfig::enabled(2, Duration::from_secs(10));
    pmode.error_handling.notify_message_producer = true;
    let msh = TestMsh::new(config_with(Vec::new(), vec![pmode]), transport.clone());

    let sender = send_agent(&msh);
    let sweep = AwarenessSweepAgent::new(msh.msh.clone(), Duration::from_millis(10));
    let record_id = msh.msh.submit(user_message("aware-1"), "aware").await.unwrap();

    assert_eq!(poll(&sender).await, 1);
    assert_eq!(msh.out_record(record_id).await.operation, Operation::Sent);

    // Not due yet
    assert_eq!(poll(&sweep).await, 0);

    for resend in 1..=2 {
        msh.advance(Duration::from_secs(10));
        assert_eq!(poll(&sweep).await, 1, "resend {} scheduled", resend);
        assert_eq!(msh.out_record(record_id).await.operation, Operation::ToBeSent);
        assert_eq!(poll(&sender).await, 1);
    }
    assert_eq!(transport.requests().len(), 3);

    msh.advance(Duration::from_secs(10));
    assert_eq!(poll(&sweep).await, 1);

    let record = msh.out_record(record_id).await;
    assert_eq!(record.operation, Operation::DeadLettered);
    assert_eq!(record.status, Status::Exception);

    let missing = msh
        .ledger
        .find_by_operation(Direction::In, Operation::ToBeNotified, 10)
        .await
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].message_type, MessageType::Error);
    assert_eq!(missing[0].ebms_ref_to_message_id.as_deref(), Some("aware-1"));

    // The sweep has nothing left to do
    msh.advance(Duration::from_secs(60));
    assert_eq!(poll(&sweep).await, 0);
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn test_receipt_stops_resending() {
    let transport = Arc::new(ScriptedTransport::accepting());
    let mut pmode = push_pmode("aware", PARTNER_URL);
    pmode.reliability.reception_awareness = ReceptionAwarenessConfig::enabled(3, Duration::from_secs(10));
    let msh = TestMsh::new(config_with(Vec::new(), vec![pmode]), transport.clone());
    let sweep = AwarenessSweepAgent::new(msh.msh.clone(), Duration::from_millis(10));

    let user = user_message("aware-2");
    let record_id = msh.msh.submit(user.clone(), "aware").await.unwrap();
    poll(&send_agent(&msh)).await;

    let receipt = SignalMessage::receipt_for(&user, msh.now());
    msh.receive(&As4Message::from_signal(receipt)).await;
    assert_eq!(msh.out_record(record_id).await.status, Status::Ack);

    msh.advance(Duration::from_secs(30));
    assert_eq!(poll(&sweep).await, 1);
    assert_eq!(msh.out_record(record_id).await.operation, Operation::Sent);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_retryable_failures_are_retried_then_dead_lettered() {
    let transport = Arc::new(ScriptedTransport::with_default(server_error()));
    let mut pmode = push_pmode("retrying", PARTNER_URL);
    pmode.reliability.retry = RetryConfig::fixed(1, Duration::from_secs(5));
    pmode.exception_handling.notify_message_producer = true;
    let msh = TestMsh::new(config_with(Vec::new(), vec![pmode]), transport.clone());

    let sender = send_agent(&msh);
    let sweep = RetrySweepAgent::new(msh.msh.clone(), Duration::from_millis(10));
    let record_id = msh.msh.submit(user_message("retry-1"), "retrying").await.unwrap();

    assert_eq!(poll(&sender).await, 1);
    assert_eq!(msh.out_record(record_id).await.operation, Operation::ToBeRetried);

    // Backoff not elapsed
    assert_eq!(poll(&sweep).await, 0);
    msh.advance(Duration::from_secs(5));
    assert_eq!(poll(&sweep).await, 1);
    assert_eq!(msh.out_record(record_id).await.operation, Operation::ToBeSent);

    poll(&sender).await;
    let record = msh.out_record(record_id).await;
    assert_eq!(record.operation, Operation::DeadLettered);
    assert_eq!(record.status, Status::Exception);
    assert_eq!(transport.requests().len(), 2);

    let exceptions = msh
        .ledger
        .find_exceptions_by_operation(Direction::Out, Operation::ToBeNotified, 10)
        .await
        .unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].ebms_ref_to_message_id.as_deref(), Some("retry-1"));
}

#[tokio::test]
async fn test_rejected_message_is_dead_lettered_at_once() {
    let transport = Arc::new(ScriptedTransport::with_default(not_found()));
    let mut pmode = push_pmode("retrying", PARTNER_URL);
    pmode.reliability.retry = RetryConfig::fixed(5, Duration::from_secs(5));
    let msh = TestMsh::new(config_with(Vec::new(), vec![pmode]), transport.clone());

    let record_id = msh.msh.submit(user_message("fatal-1"), "retrying").await.unwrap();
    poll(&send_agent(&msh)).await;

    assert_eq!(msh.out_record(record_id).await.operation, Operation::DeadLettered);
    assert_eq!(transport.requests().len(), 1);

    // No notification asked for, the exception is only recorded
    let exceptions = msh
        .ledger
        .find_exceptions_by_operation(Direction::Out, Operation::Created, 10)
        .await
        .unwrap();
    assert_eq!(exceptions.len(), 1);
}

#[tokio::test]
async fn test_cancelled_send_releases_claim() {
    let transport = Arc::new(ScriptedTransport::accepting());
    let msh = TestMsh::new(
        config_with(Vec::new(), vec![push_pmode("send-invoice", PARTNER_URL)]),
        transport.clone(),
    );
    let record_id = msh
        .msh
        .submit(user_message("cancel-1"), "send-invoice")
        .await
        .unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let sent = send_agent(&msh).poll_once(&cancelled).await.unwrap();

    assert_eq!(sent, 0);
    assert!(transport.requests().is_empty());
    assert_eq!(msh.out_record(record_id).await.operation, Operation::ToBeSent);

    // A later poll picks it up again
    assert_eq!(poll(&send_agent(&msh)).await, 1);
    assert_eq!(msh.out_record(record_id).await.operation, Operation::Sent);
}

#[tokio::test]
async fn test_pull_mep_message_is_not_pushed() {
    let transport = Arc::new(ScriptedTransport::accepting());
    let msh = TestMsh::new(
        config_with(Vec::new(), vec![pull_pmode("pull-invoice")]),
        transport.clone(),
    );
    let record_id = msh
        .msh
        .submit(user_message("waiting-1"), "pull-invoice")
        .await
        .unwrap();

    assert_eq!(poll(&send_agent(&msh)).await, 0);
    assert!(transport.requests().is_empty());
    assert_eq!(msh.out_record(record_id).await.operation, Operation::ToBeSent);
}
