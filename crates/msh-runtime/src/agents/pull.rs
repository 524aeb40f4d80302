//! Periodic PullRequests

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use msh_core::message::{new_message_id, PullRequest, SignalMessage};
use msh_core::{As4Message, MessagingContext, MshResult, PullRequestConfig};

use super::Agent;
use crate::msh::Msh;

/// Pulls user messages from one MPC of a partner
pub struct PullAgent {
    msh: Arc<Msh>,
    config: PullRequestConfig,
    name: String,
}

impl PullAgent {
    pub fn new(msh: Arc<Msh>, config: PullRequestConfig) -> Self {
        let name = format!("pull:{}", config.sending_pmode_id);
        Self { msh, config, name }
    }
}

#[async_trait]
impl Agent for PullAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        let services = self.msh.services();
        let pmode = services.pmodes.require_sending_pmode(&self.config.sending_pmode_id)?;
        let mpc = match &self.config.mpc {
            Some(mpc) => mpc.clone(),
            None => pmode.mpc().to_string(),
        };

        let request = PullRequest {
            message_id: new_message_id(),
            mpc,
            timestamp: services.time_source.now(),
        };
        debug!(agent = %self.name, message_id = %request.message_id, mpc = %request.mpc, "Sending PullRequest");

        let message = As4Message::from_signal(SignalMessage::PullRequest(request));
        let context =
            MessagingContext::for_send(message, pmode, None).with_cancellation(cancellation.child_token());
        let outcome = self.msh.run_send_pipeline(context).await;

        if let Some(error) = &outcome.error {
            warn!(agent = %self.name, error = %error.description, "PullRequest failed");
        }
        if let Some(error) = &outcome.reply_error {
            warn!(agent = %self.name, error = %error.description, "Pulled message could not be processed");
        }
        Ok(usize::from(outcome.pulled_user_message()))
    }
}
