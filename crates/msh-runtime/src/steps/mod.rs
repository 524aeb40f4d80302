//! Pipeline steps
//!
//! Every step holds the shared [`Services`] and mutates the context it is
//! handed. Steps are grouped by the pipeline that uses them; steps shared by
//! the receive pipeline and its error path live in [`receive`].

pub mod error;
pub mod receive;
pub mod send;

use std::sync::Arc;
use tracing::warn;

use msh_core::message::SignalMessage;
use msh_core::pmode::{from_snapshot, NotifyHandling, ReplyPattern, SendingPMode};
use msh_core::{MessageRecord, MessagingContext, MshError, MshResult, ProcessingMode};

pub use error::{CreateErrorSignal, StoreInException};
pub use receive::{
    CreateReceipts, DecryptMessage, DeserializeMessage, DeterminePModes, Respond, SecurePullResponse,
    SelectPullResponse, StoreOutboundSignals, StoreReceivedMessage, ValidateMessage, VerifySignature,
};
pub use send::{BundlePullSignals, DynamicDiscoveryStep, EncryptMessage, SendMessage, SignMessage};

// ----------------------------------------------------------------------------
// Shared Helpers
// ----------------------------------------------------------------------------

/// How signals answering the received message travel back
///
/// Answers to a pulled message can only ride on our next PullRequest. A
/// callback without a sending PMode has nowhere to go and is answered on the
/// HTTP response instead.
pub(crate) fn reply_pattern(context: &MessagingContext) -> ReplyPattern {
    if context.mode == ProcessingMode::PullReceive {
        return ReplyPattern::PiggyBack;
    }
    match context.receiving_pmode.as_ref() {
        Some(pmode) => match pmode.reply_handling.reply_pattern {
            ReplyPattern::Callback if pmode.reply_handling.sending_pmode_id.is_none() => {
                warn!(pmode = %pmode.id, "Callback reply pattern without a sending PMode, answering in-line");
                ReplyPattern::Response
            }
            pattern => pattern,
        },
        None => ReplyPattern::default(),
    }
}

/// Producer notification settings that apply to a received signal
pub(crate) fn signal_handling<'a>(signal: &SignalMessage, pmode: &'a SendingPMode) -> Option<&'a NotifyHandling> {
    match signal {
        SignalMessage::Receipt(_) => Some(&pmode.receipt_handling),
        SignalMessage::Error(_) => Some(&pmode.error_handling),
        SignalMessage::PullRequest(_) => None,
    }
}

/// Restore the sending PMode a record was processed under
pub(crate) fn sending_pmode_of(record: &MessageRecord) -> MshResult<Option<Arc<SendingPMode>>> {
    match record.pmode_snapshot.as_deref() {
        Some(snapshot) => {
            let pmode: SendingPMode = from_snapshot(snapshot)?;
            Ok(Some(Arc::new(pmode)))
        }
        None => Ok(None),
    }
}

/// Sending PMode of the context, required by every send step
pub(crate) fn require_sending_pmode(context: &MessagingContext) -> MshResult<Arc<SendingPMode>> {
    context
        .sending_pmode
        .clone()
        .ok_or_else(|| MshError::config_error("No sending PMode bound to the message"))
}
