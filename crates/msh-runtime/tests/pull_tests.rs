//! Pull exchange tests
//!
//! Two handlers wired back to back: one keeps messages waiting on an MPC,
//! the other pulls them and piggybacks its receipts on the next PullRequest.


use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use msh_core::pmode::ReplyPattern;
use msh_core::{
    As4Message, Direction, Ledger, MessageType, MshConfig, Operation, PullRequestConfig, Status,
};
use msh_runtime::{Agent, PullAgent};
use test_utils::*;

fn pull_config(sending_pmode_id: &str) -> PullRequestConfig {
    PullRequestConfig {
        sending_pmode_id: sending_pmode_id.to_string(),
        mpc: None,
        interval_ms: 10,
    }
}

async fn poll(agent: &PullAgent) -> usize {
    agent.poll_once(&CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn test_pulled_message_is_received_and_acknowledged() {
    let responder = TestMsh::new(
        config_with(Vec::new(), vec![pull_pmode("pull-invoice")]),
        Arc::new(ScriptedTransport::accepting()),
    );
    let loopback = Arc::new(LoopbackTransport::default());
    let initiator = TestMsh::new(
        config_with(
            vec![receiving_pmode("receive-pulled", ReplyPattern::Response)],
            vec![pull_request_pmode("pull-from-partner", PARTNER_URL)],
        ),
        loopback.clone(),
    );
    loopback.connect(responder.msh.clone());

    let waiting = responder
        .msh
        .submit(user_message("pulled-1"), "pull-invoice")
        .await
        .unwrap();
    let agent = PullAgent::new(initiator.msh.clone(), pull_config("pull-from-partner"));
    assert_eq!(agent.name(), "pull:pull-from-partner");

    // First PullRequest brings the waiting message over
    assert_eq!(poll(&agent).await, 1);
    assert_eq!(responder.out_record(waiting).await.operation, Operation::Sent);

    let received = initiator.in_records("pulled-1").await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].operation, Operation::ToBeDelivered);
    assert_eq!(received[0].mpc.as_deref(), Some(PULL_MPC));

    let receipts = initiator
        .ledger
        .find_by_operation(Direction::Out, Operation::ToBePiggyBacked, 10)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].message_type, MessageType::Receipt);
    assert_eq!(receipts[0].url.as_deref(), Some(PARTNER_URL));

    // Second PullRequest carries the receipt and finds the MPC empty
    assert_eq!(poll(&agent).await, 0);
    assert_eq!(loopback.exchanges(), 2);
    assert_eq!(responder.out_record(waiting).await.status, Status::Ack);

    let receipt = initiator.out_record(receipts[0].record_id).await;
    assert_eq!(receipt.operation, Operation::Sent);
    assert_eq!(receipt.status, Status::Sent);
}

#[tokio::test]
async fn test_failed_pull_request_releases_bundled_signals() {
    let transport = Arc::new(ScriptedTransport::accepting());
    transport.push(server_error());
    let msh = TestMsh::new(
        config_with(
            vec![receiving_pmode("receive-invoice", ReplyPattern::PiggyBack)],
            vec![pull_request_pmode("pull-from-partner", PARTNER_URL)],
        ),
        transport.clone(),
    );

    let mut user = user_message("pushed-1");
    user.mpc = PULL_MPC.to_string();
    msh.receive(&As4Message::from_user_message(user)).await;
    let waiting = msh
        .ledger
        .find_by_operation(Direction::Out, Operation::ToBePiggyBacked, 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    let receipt_id = waiting[0].record_id;

    let agent = PullAgent::new(msh.msh.clone(), pull_config("pull-from-partner"));
    assert_eq!(poll(&agent).await, 0);

    // The receipt travelled with the failed PullRequest and is waiting again
    let bundled = transport.sent_messages();
    assert_eq!(bundled.len(), 1);
    assert!(bundled[0].is_pull_request());
    assert_eq!(bundled[0].signal_messages().count(), 2);
    assert_eq!(msh.out_record(receipt_id).await.operation, Operation::ToBePiggyBacked);

    assert_eq!(poll(&agent).await, 0);
    assert_eq!(msh.out_record(receipt_id).await.operation, Operation::Sent);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn test_pull_from_unknown_pmode_fails() {
    let msh = TestMsh::new(MshConfig::testing(), Arc::new(ScriptedTransport::accepting()));
    let agent = PullAgent::new(msh.msh.clone(), pull_config("missing"));

    assert!(agent.poll_once(&CancellationToken::new()).await.is_err());
    assert_eq!(agent.interval(), Duration::from_millis(10));
}
