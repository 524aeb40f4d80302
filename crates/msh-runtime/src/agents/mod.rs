//! Background agents
//!
//! Each agent polls the ledger for one kind of work on a fixed interval and
//! claims records with a compare-and-set transition before touching them, so
//! any number of agents (in this process or another one sharing the ledger)
//! can run side by side. Agents stop at their next poll once cancelled;
//! in-flight invocations see the cancellation between pipeline steps.

mod deliver;
mod notify;
mod pull;
mod send;
mod sweep;

pub use deliver::DeliverAgent;
pub use notify::NotifyAgent;
pub use pull::PullAgent;
pub use send::SendAgent;
pub use sweep::{AwarenessSweepAgent, RetrySweepAgent};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use msh_core::MshResult;

use crate::supervisor::{AgentEvent, AgentHealthStatus};

/// Consecutive failed polls after which an agent reports itself failed
const FAILED_AFTER: u32 = 5;

/// A periodically polling worker
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name used in logs and health reports
    fn name(&self) -> &str;

    /// Pause between two polls
    fn interval(&self) -> Duration;

    /// Process one batch of work, returning how many records were handled
    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize>;
}

/// Poll loop driven by the supervisor
pub(crate) async fn run_agent(
    agent: Arc<dyn Agent>,
    cancellation: CancellationToken,
    health: mpsc::UnboundedSender<AgentEvent>,
) {
    let name = agent.name().to_string();
    info!(agent = %name, interval_ms = agent.interval().as_millis() as u64, "Agent started");

    let mut consecutive_failures: u32 = 0;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = tokio::time::sleep(agent.interval()) => {}
        }

        match agent.poll_once(&cancellation).await {
            Ok(processed) => {
                if processed > 0 {
                    debug!(agent = %name, processed, "Poll handled work");
                }
                if consecutive_failures > 0 {
                    consecutive_failures = 0;
                    let _ = health.send(AgentEvent::new(&name, AgentHealthStatus::Healthy, "Recovered"));
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                let status = if consecutive_failures >= FAILED_AFTER {
                    AgentHealthStatus::Failed
                } else {
                    AgentHealthStatus::Degraded
                };
                warn!(agent = %name, error = %e, consecutive_failures, "Poll failed");
                let _ = health.send(AgentEvent::new(&name, status, e.to_string()));
            }
        }
    }

    info!(agent = %name, "Agent stopped");
}

/// Count handled records of a batch, logging the failures
///
/// A batch where every record failed fails the poll, so that a broken ledger
/// or collaborator shows up in the agent's health.
pub(crate) fn settle_batch(agent: &str, results: Vec<MshResult<bool>>) -> MshResult<usize> {
    let total = results.len();
    let mut processed = 0;
    let mut first_error = None;
    let mut failures = 0;

    for result in results {
        match result {
            Ok(true) => processed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(agent, error = %e, "Record processing failed");
                failures += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if failures == total => Err(e),
        _ => Ok(processed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msh_core::MshError;

    #[test]
    fn test_batch_fails_only_when_every_record_failed() {
        let mixed = vec![Ok(true), Err(MshError::Cancelled), Ok(false)];
        assert_eq!(settle_batch("test", mixed).unwrap(), 1);

        let broken = vec![Err(MshError::Cancelled), Err(MshError::pipeline_error("x"))];
        assert!(matches!(settle_batch("test", broken), Err(MshError::Cancelled)));

        assert_eq!(settle_batch("test", Vec::new()).unwrap(), 0);
    }
}
