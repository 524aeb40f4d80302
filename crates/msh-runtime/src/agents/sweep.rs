//! Reliability sweeps

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use msh_core::MshResult;

use super::Agent;
use crate::msh::Msh;

/// Resends unanswered user messages and dead-letters expired ones
pub struct AwarenessSweepAgent {
    msh: Arc<Msh>,
    interval: Duration,
}

impl AwarenessSweepAgent {
    pub fn new(msh: Arc<Msh>, interval: Duration) -> Self {
        Self { msh, interval }
    }
}

#[async_trait]
impl Agent for AwarenessSweepAgent {
    fn name(&self) -> &str {
        "awareness-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        if cancellation.is_cancelled() {
            return Ok(0);
        }
        let report = self.msh.sweep_reception_awareness().await?;
        if report.dead_lettered > 0 {
            info!(
                resends = report.resends,
                dead_lettered = report.dead_lettered,
                "Unanswered messages dead-lettered"
            );
        }
        Ok(report.completed + report.resends + report.dead_lettered)
    }
}

/// Requeues owners whose retry interval elapsed
pub struct RetrySweepAgent {
    msh: Arc<Msh>,
    interval: Duration,
}

impl RetrySweepAgent {
    pub fn new(msh: Arc<Msh>, interval: Duration) -> Self {
        Self { msh, interval }
    }
}

#[async_trait]
impl Agent for RetrySweepAgent {
    fn name(&self) -> &str {
        "retry-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancellation: &CancellationToken) -> MshResult<usize> {
        if cancellation.is_cancelled() {
            return Ok(0);
        }
        let report = self.msh.sweep_retries().await?;
        Ok(report.requeued + report.completed)
    }
}
