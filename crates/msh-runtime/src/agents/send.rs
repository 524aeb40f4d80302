//! Push sending of OutMessages in ToBeSent

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use msh_core::pmode::SendingPMode;
use msh_core::reliability::SendCallbacks;
use msh_core::{
    As4Message, Direction, MessageRecord, MessagingContext, MshError, MshResult, Operation,
    RetryOwner, SendResult,
};

use super::{settle_batch, Agent};
use crate::msh::Msh;
use crate::steps::sending_pmode_of;

pub struct SendAgent {
    msh: Arc<Msh>,
    interval: Duration,
    batch_size: usize,
}

impl SendAgent {
    pub fn new(msh: Arc<Msh>, interval: Duration, batch_size: usize) -> Self {
        Self {
            msh,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    async fn prepare(&self, record: &MessageRecord) -> MshResult<(As4Message, Arc<SendingPMode>)> {
        let services = self.msh.services();
        let location = record.message_location.as_deref().ok_or_else(|| {
            MshError::pipeline_error(format!("{} has no stored body", record.ebms_message_id))
        })?;
        let message = services.load_message(location).await?;

        let pmode = match sending_pmode_of(record)? {
            Some(pmode) => pmode,
            None => {
                let id = record.pmode_id.as_deref().ok_or_else(|| {
                    MshError::config_error(format!("{} was stored without a PMode", record.ebms_message_id))
                })?;
                services.pmodes.require_sending_pmode(id)?
            }
        };
        Ok((message, pmode))
    }

    async fn send_record(&self, record: MessageRecord, cancellation: &CancellationToken) -> MshResult<bool> {
        let services = self.msh.services();
        let claimed = services
            .ledger
            .try_transition(Direction::Out, record.record_id, &[Operation::ToBeSent], Operation::Sending)
            .await?;
        if !claimed {
            return Ok(false);
        }

        let (message, pmode) = match self.prepare(&record).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(message_id = %record.ebms_message_id, error = %e, "Stored message cannot be sent");
                let callbacks = SendCallbacks::new(None, services.time_source.clone());
                services
                    .retry
                    .handle(RetryOwner::OutMessage(record.record_id), SendResult::FatalFail, &callbacks)
                    .await?;
                return Err(e);
            }
        };

        let context = MessagingContext::for_send(message, pmode, Some(record.record_id))
            .with_cancellation(cancellation.child_token());
        let outcome = self.msh.run_send_pipeline(context).await;
        Ok(outcome.send_result.is_some())
    }
}

#[async_trait]
impl Agent for SendAgent {
    fn name(&self) -> &str {
        "send"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        // Pull-MEP user messages wait for a PullRequest and are not returned here
        let pushable = self
            .msh
            .services()
            .ledger
            .find_push_candidates(self.batch_size)
            .await?;

        let results: Vec<MshResult<bool>> = stream::iter(pushable)
            .take_until(cancellation.cancelled())
            .map(|record| self.send_record(record, cancellation))
            .buffer_unordered(self.batch_size)
            .collect()
            .await;
        settle_batch(self.name(), results)
    }
}
