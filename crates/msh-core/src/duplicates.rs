//! Duplicate and lifecycle classification
//!
//! Decides, for every message unit of a received message, whether it was
//! seen before and which operation its ledger record starts in.

use hashbrown::HashMap;

use crate::ledger::{Ledger, LedgerResult, Operation, Status};
use crate::message::{As4Message, SignalMessage, UserMessage};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::types::Direction;

/// Build the `id -> is_duplicate` map for a received message
///
/// User messages are keyed by their ebMS id, receipts and errors by the id
/// they refer to. Exactly one ledger query is issued per kind.
pub async fn classify_duplicates(ledger: &dyn Ledger, message: &As4Message) -> LedgerResult<HashMap<String, bool>> {
    let user_ids: Vec<String> = message.user_messages().map(|u| u.message_id.clone()).collect();
    let signal_refs: Vec<String> = message
        .signal_messages()
        .filter(|s| s.message_type().is_receipt_or_error())
        .filter_map(|s| s.ref_to_message_id().map(str::to_string))
        .collect();

    let mut classification = HashMap::with_capacity(user_ids.len() + signal_refs.len());

    if !user_ids.is_empty() {
        let existing = ledger.find_existing_ids(Direction::In, &user_ids).await?;
        for id in user_ids {
            let duplicate = existing.contains(&id);
            classification.insert(id, duplicate);
        }
    }

    if !signal_refs.is_empty() {
        let existing = ledger.find_existing_refs(Direction::In, &signal_refs).await?;
        for ref_to in signal_refs {
            let duplicate = existing.contains(&ref_to);
            classification.insert(ref_to, duplicate);
        }
    }

    Ok(classification)
}

/// Whether a received user message is handed to the business application
pub fn is_delivery_eligible(user_message: &UserMessage, pmode: &ReceivingPMode, is_duplicate: bool) -> bool {
    pmode.deliver.is_enabled && !is_duplicate && !user_message.is_test_message()
}

/// Whether the message producer is notified about a received receipt or error
pub fn is_notify_eligible(signal: &SignalMessage, pmode: Option<&SendingPMode>, is_duplicate: bool) -> bool {
    if is_duplicate {
        return false;
    }
    match (signal, pmode) {
        (SignalMessage::Receipt(_), Some(pmode)) => pmode.receipt_handling.notify_message_producer,
        (SignalMessage::Error(error), Some(pmode)) => {
            !error.is_pull_request_warning() && pmode.error_handling.notify_message_producer
        }
        _ => false,
    }
}

/// Operation a received user message record starts in
pub fn initial_user_operation(user_message: &UserMessage, pmode: &ReceivingPMode, is_duplicate: bool) -> Operation {
    if is_delivery_eligible(user_message, pmode, is_duplicate) {
        Operation::ToBeDelivered
    } else {
        Operation::Created
    }
}

/// Operation a received receipt or error record starts in
pub fn initial_signal_operation(signal: &SignalMessage, pmode: Option<&SendingPMode>, is_duplicate: bool) -> Operation {
    if is_notify_eligible(signal, pmode, is_duplicate) {
        Operation::ToBeNotified
    } else {
        Operation::Created
    }
}

/// Status a received signal sets on the OutMessage it answers
///
/// Applied for duplicates too: a duplicate receipt still acknowledges.
pub fn answer_status(signal: &SignalMessage) -> Option<Status> {
    match signal {
        SignalMessage::Receipt(_) => Some(Status::Ack),
        SignalMessage::Error(error) if error.is_pull_request_warning() => None,
        SignalMessage::Error(_) => Some(Status::Nack),
        SignalMessage::PullRequest(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, MessageRecord};
    use crate::message::{MessageUnit, Party, Service, TEST_ACTION, TEST_SERVICE};
    use crate::types::Timestamp;

    fn user(id: &str) -> UserMessage {
        let mut user = UserMessage::new(
            Party::new("Sender", "a"),
            Party::new("Receiver", "b"),
            Service::new("svc"),
            "act",
        );
        user.message_id = id.to_string();
        user
    }

    #[tokio::test]
    async fn test_classification_uses_existing_records() {
        let ledger = InMemoryLedger::default();
        let seen = user("seen");
        ledger
            .insert(MessageRecord::for_unit(
                Direction::In,
                &MessageUnit::User(seen.clone()),
                Timestamp::new(0),
            ))
            .await
            .unwrap();

        let mut message = As4Message::from_user_message(seen);
        message.add_unit(MessageUnit::User(user("fresh")));

        let classification = classify_duplicates(&ledger, &message).await.unwrap();
        assert_eq!(classification.get("seen"), Some(&true));
        assert_eq!(classification.get("fresh"), Some(&false));
    }

    #[test]
    fn test_delivery_eligibility() {
        let mut pmode = ReceivingPMode::new("r");
        pmode.deliver.is_enabled = true;

        let message = user("m");
        assert!(is_delivery_eligible(&message, &pmode, false));
        assert!(!is_delivery_eligible(&message, &pmode, true));
        assert_eq!(initial_user_operation(&message, &pmode, true), Operation::Created);

        let mut test_message = user("t");
        test_message.collaboration.service = Service::new(TEST_SERVICE);
        test_message.collaboration.action = TEST_ACTION.to_string();
        assert!(!is_delivery_eligible(&test_message, &pmode, false));
    }

    #[test]
    fn test_duplicate_receipt_still_acknowledges() {
        let receipt = SignalMessage::receipt_for(&user("m"), Timestamp::new(1));
        let mut pmode = SendingPMode::new("s");
        pmode.receipt_handling.notify_message_producer = true;

        assert!(is_notify_eligible(&receipt, Some(&pmode), false));
        assert!(!is_notify_eligible(&receipt, Some(&pmode), true));
        assert_eq!(answer_status(&receipt), Some(Status::Ack));
    }
}
