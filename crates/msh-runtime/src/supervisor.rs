//! Agent Supervisor
//!
//! Manages the lifecycle of the background agents, providing:
//! - Agent spawning on a shared task tracker
//! - Health tracking fed by the agents' failure reports
//! - Periodic health logging
//! - Graceful shutdown with a deadline, aborting stragglers

use hashbrown::HashMap;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::{interval, Duration, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::agents::{run_agent, Agent};

/// Agents that reported nothing for this long while degraded are logged again
const STALE_THRESHOLD: Duration = Duration::from_secs(60);

// ----------------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentHealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Health change reported by an agent
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub agent: String,
    pub status: AgentHealthStatus,
    pub message: String,
}

impl AgentEvent {
    pub fn new(agent: &str, status: AgentHealthStatus, message: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Last known health of one agent
#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub status: AgentHealthStatus,
    pub last_update: Instant,
    pub last_error: Option<String>,
}

impl AgentHealth {
    fn healthy() -> Self {
        Self {
            status: AgentHealthStatus::Healthy,
            last_update: Instant::now(),
            last_error: None,
        }
    }
}

type HealthMap = Arc<RwLock<HashMap<String, AgentHealth>>>;

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

/// Spawns, watches and stops the agents
pub struct Supervisor {
    tracker: TaskTracker,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    health: HealthMap,
    monitoring_interval: Duration,
}

impl Supervisor {
    pub fn new(monitoring_interval: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancellation: CancellationToken::new(),
            handles: Vec::new(),
            health: Arc::new(RwLock::new(HashMap::new())),
            monitoring_interval,
        }
    }

    /// Spawn the agents and the health monitor
    pub async fn start(&mut self, agents: Vec<Arc<dyn Agent>>) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        {
            let mut health = self.health.write().await;
            for agent in &agents {
                health.insert(agent.name().to_string(), AgentHealth::healthy());
            }
        }

        let count = agents.len();
        for agent in agents {
            let handle = self
                .tracker
                .spawn(run_agent(agent, self.cancellation.clone(), event_sender.clone()));
            self.handles.push(handle);
        }

        let monitor = monitor(
            event_receiver,
            self.health.clone(),
            self.monitoring_interval,
            self.cancellation.clone(),
        );
        self.handles.push(self.tracker.spawn(monitor));

        info!(agents = count, "Supervisor started");
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation.is_cancelled()
    }

    /// Snapshot of every agent's health
    pub async fn health(&self) -> HashMap<String, AgentHealth> {
        self.health.read().await.clone()
    }

    /// Stop all agents, aborting those still busy after `timeout`
    ///
    /// Returns whether every agent stopped on its own.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        info!("Supervisor shutdown requested");
        self.cancellation.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("All agents shut down");
                true
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Agents did not stop in time, aborting");
                for handle in &self.handles {
                    handle.abort();
                }
                false
            }
        }
    }
}

async fn monitor(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    health: HealthMap,
    monitoring_interval: Duration,
    cancellation: CancellationToken,
) {
    let mut health_check_interval = interval(monitoring_interval);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,

            Some(event) = events.recv() => {
                update_health(&health, event).await;
            }

            _ = health_check_interval.tick() => {
                perform_health_check(&health).await;
            }
        }
    }
    debug!("Health monitor stopped");
}

async fn update_health(health: &HealthMap, event: AgentEvent) {
    match event.status {
        AgentHealthStatus::Failed => error!(agent = %event.agent, error = %event.message, "Agent failing"),
        AgentHealthStatus::Degraded => warn!(agent = %event.agent, error = %event.message, "Agent degraded"),
        AgentHealthStatus::Healthy => info!(agent = %event.agent, "Agent healthy again"),
    }

    let mut health = health.write().await;
    let entry = health.entry(event.agent).or_insert_with(AgentHealth::healthy);
    entry.status = event.status;
    entry.last_update = Instant::now();
    entry.last_error = match event.status {
        AgentHealthStatus::Healthy => None,
        _ => Some(event.message),
    };
}

async fn perform_health_check(health: &HealthMap) {
    let now = Instant::now();
    let health = health.read().await;

    let mut unhealthy = 0;
    for (agent, info) in health.iter() {
        if info.status == AgentHealthStatus::Healthy {
            continue;
        }
        unhealthy += 1;
        if now.duration_since(info.last_update) > STALE_THRESHOLD {
            warn!(agent = %agent, status = ?info.status, error = ?info.last_error, "Agent still unhealthy");
        }
    }
    debug!(agents = health.len(), unhealthy, "Health check");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use msh_core::{MshError, MshResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAgent {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn poll_once(&self, _cancellation: &CancellationToken) -> MshResult<usize> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(MshError::pipeline_error("ledger unavailable"))
        }
    }

    #[tokio::test]
    async fn test_failing_agent_is_reported_and_stopped() {
        let agent = Arc::new(FlakyAgent {
            polls: AtomicUsize::new(0),
        });
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        supervisor.start(vec![agent.clone() as Arc<dyn Agent>]).await;

        let mut status = AgentHealthStatus::Healthy;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = supervisor.health().await["flaky"].status;
            if status == AgentHealthStatus::Failed {
                break;
            }
        }
        assert_eq!(status, AgentHealthStatus::Failed);
        assert!(supervisor.health().await["flaky"].last_error.is_some());

        assert!(supervisor.shutdown(Duration::from_secs(1)).await);
        let polls = agent.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agent.polls.load(Ordering::SeqCst), polls);
    }
}
