//! Delivery of received user messages to the business application

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use msh_core::pmode::{from_snapshot, ReceivingPMode};
use msh_core::reliability::DeliverCallbacks;
use msh_core::send_result::classify_error;
use msh_core::{DeliverMessage, Direction, MessageRecord, MshError, MshResult, Operation, RetryOwner, SendResult};

use super::{settle_batch, Agent};
use crate::msh::Msh;

pub struct DeliverAgent {
    msh: Arc<Msh>,
    interval: Duration,
    batch_size: usize,
}

impl DeliverAgent {
    pub fn new(msh: Arc<Msh>, interval: Duration, batch_size: usize) -> Self {
        Self {
            msh,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    async fn prepare(&self, record: &MessageRecord) -> MshResult<DeliverMessage> {
        let snapshot = record.pmode_snapshot.as_deref().ok_or_else(|| {
            MshError::config_error(format!("{} was stored without a PMode", record.ebms_message_id))
        })?;
        let pmode: ReceivingPMode = from_snapshot(snapshot)?;

        let body = match record.message_location.as_deref() {
            Some(location) => self.msh.services().bodies.load(location).await?,
            None => Vec::new(),
        };
        Ok(DeliverMessage {
            record: record.clone(),
            body,
            method: pmode.deliver.delivery_method,
        })
    }

    async fn deliver_record(&self, record: MessageRecord) -> MshResult<bool> {
        let services = self.msh.services();
        let deliverer = match &services.deliverer {
            Some(deliverer) => deliverer.clone(),
            None => return Ok(false),
        };
        let claimed = services
            .ledger
            .try_transition(Direction::In, record.record_id, &[Operation::ToBeDelivered], Operation::Delivering)
            .await?;
        if !claimed {
            return Ok(false);
        }

        let verdict = match self.prepare(&record).await {
            Ok(message) => match deliverer.deliver(message).await {
                Ok(()) => SendResult::Success,
                Err(e) => {
                    warn!(message_id = %record.ebms_message_id, error = %e, "Delivery failed");
                    classify_error(&e)
                }
            },
            Err(e) => {
                warn!(message_id = %record.ebms_message_id, error = %e, "Message cannot be delivered");
                SendResult::FatalFail
            }
        };

        let decision = services
            .retry
            .handle(RetryOwner::InMessage(record.record_id), verdict, &DeliverCallbacks)
            .await?;
        debug!(message_id = %record.ebms_message_id, ?decision, "Delivery settled");
        Ok(true)
    }
}

#[async_trait]
impl Agent for DeliverAgent {
    fn name(&self) -> &str {
        "deliver"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        if self.msh.services().deliverer.is_none() || cancellation.is_cancelled() {
            return Ok(0);
        }
        let waiting = self
            .msh
            .services()
            .ledger
            .find_by_operation(Direction::In, Operation::ToBeDelivered, self.batch_size)
            .await?;

        // Records not yet started when shutdown begins stay queued
        let results: Vec<MshResult<bool>> = stream::iter(waiting)
            .take_until(cancellation.cancelled())
            .map(|record| self.deliver_record(record))
            .buffer_unordered(self.batch_size)
            .collect()
            .await;
        settle_batch(self.name(), results)
    }
}
