//! Runtime Builder API
//!
//! Provides a builder-style API for consumers (CLI/HTTP layer/tests) to plug in
//! their collaborators and get either a bare [`Msh`] or a running instance
//! with its background agents.

use hashbrown::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use msh_core::pmode::{InMemoryPModeStore, PModeResolver};
use msh_core::{
    Deliverer, DynamicDiscovery, InMemoryBodyStore, InMemoryLedger, Ledger, MessageBodyStore, MessageCodec,
    MshConfig, MshResult, Notifier, PModeProvider, PullBundlingService, ReceptionAwarenessEngine, RetryEngine,
    SecurityProvider, SystemTimeSource, TimeSource, Transport,
};

use crate::agents::{
    Agent, AwarenessSweepAgent, DeliverAgent, NotifyAgent, PullAgent, RetrySweepAgent, SendAgent,
};
use crate::codec::JsonCodec;
use crate::msh::Msh;
use crate::services::{NoSecurity, NoTransport, Services};
use crate::supervisor::{AgentHealth, Supervisor};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a message service handler and its agents
pub struct MshBuilder {
    config: MshConfig,
    ledger: Option<Arc<dyn Ledger>>,
    bodies: Option<Arc<dyn MessageBodyStore>>,
    codec: Option<Arc<dyn MessageCodec>>,
    security: Option<Arc<dyn SecurityProvider>>,
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn DynamicDiscovery>>,
    deliverer: Option<Arc<dyn Deliverer>>,
    notifier: Option<Arc<dyn Notifier>>,
    pmodes: Option<Arc<dyn PModeProvider>>,
    time_source: Option<Arc<dyn TimeSource>>,
    shutdown_timeout: Duration,
}

impl MshBuilder {
    /// Create a builder; unset collaborators fall back to in-memory stand-ins
    pub fn new(config: MshConfig) -> Self {
        Self {
            config,
            ledger: None,
            bodies: None,
            codec: None,
            security: None,
            transport: None,
            discovery: None,
            deliverer: None,
            notifier: None,
            pmodes: None,
            time_source: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_body_store(mut self, bodies: Arc<dyn MessageBodyStore>) -> Self {
        self.bodies = Some(bodies);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DynamicDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use a PMode provider instead of the PModes of the configuration
    pub fn with_pmodes(mut self, pmodes: Arc<dyn PModeProvider>) -> Self {
        self.pmodes = Some(pmodes);
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    /// Deadline for agents to stop before they are aborted
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the handler without starting any agent
    pub fn build(self) -> MshResult<Msh> {
        self.build_parts().map(|(msh, _, _)| msh)
    }

    fn build_parts(self) -> MshResult<(Msh, MshConfig, Duration)> {
        self.config.validate()?;

        let time_source = self
            .time_source
            .unwrap_or_else(|| Arc::new(SystemTimeSource::new()) as Arc<dyn TimeSource>);
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new(time_source.clone())) as Arc<dyn Ledger>);
        let bodies = self
            .bodies
            .unwrap_or_else(|| Arc::new(InMemoryBodyStore::new()) as Arc<dyn MessageBodyStore>);
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec) as Arc<dyn MessageCodec>);
        let pmodes = match self.pmodes {
            Some(pmodes) => pmodes,
            None => Arc::new(InMemoryPModeStore::from_config(&self.config.pmodes)?) as Arc<dyn PModeProvider>,
        };

        let services = Services {
            awareness: Arc::new(ReceptionAwarenessEngine::new(ledger.clone(), time_source.clone())),
            retry: Arc::new(RetryEngine::new(ledger.clone(), time_source.clone())),
            pull: Arc::new(PullBundlingService::new(ledger.clone(), bodies.clone(), codec.clone())),
            resolver: Arc::new(PModeResolver::new(self.config.resolver.clone())),
            security: self.security.unwrap_or_else(|| Arc::new(NoSecurity) as Arc<dyn SecurityProvider>),
            transport: self.transport.unwrap_or_else(|| Arc::new(NoTransport) as Arc<dyn Transport>),
            discovery: self.discovery,
            deliverer: self.deliverer,
            notifier: self.notifier,
            receive: self.config.receive.clone(),
            ledger,
            bodies,
            codec,
            pmodes,
            time_source,
        };

        info!(
            sending_pmodes = self.config.pmodes.sending.len(),
            receiving_pmodes = self.config.pmodes.receiving.len(),
            "Message service handler built"
        );
        Ok((Msh::new(services), self.config, self.shutdown_timeout))
    }

    /// Build the handler and start the enabled agents
    pub async fn build_and_start(self) -> MshResult<RuntimeHandle> {
        let (msh, config, shutdown_timeout) = self.build_parts()?;
        let msh = Arc::new(msh);
        let agents = agents_for(&msh, &config);

        let mut supervisor = Supervisor::new(config.agents.monitoring_interval());
        supervisor.start(agents).await;

        info!("Message service handler started");
        Ok(RuntimeHandle {
            msh,
            supervisor,
            shutdown_timeout,
        })
    }
}

fn agents_for(msh: &Arc<Msh>, config: &MshConfig) -> Vec<Arc<dyn Agent>> {
    let settings = &config.agents;
    let services = msh.services();
    let mut agents: Vec<Arc<dyn Agent>> = Vec::new();

    if settings.send_enabled {
        agents.push(Arc::new(SendAgent::new(msh.clone(), settings.poll_interval(), settings.batch_size)));
    }
    if settings.deliver_enabled {
        if services.deliverer.is_some() {
            agents.push(Arc::new(DeliverAgent::new(msh.clone(), settings.poll_interval(), settings.batch_size)));
        } else {
            info!("No deliverer configured, deliver agent not started");
        }
    }
    if settings.notify_enabled {
        if services.notifier.is_some() {
            agents.push(Arc::new(NotifyAgent::new(msh.clone(), settings.poll_interval(), settings.batch_size)));
        } else {
            info!("No notifier configured, notify agent not started");
        }
    }
    if settings.pull_enabled {
        for pull in &config.pull {
            agents.push(Arc::new(PullAgent::new(msh.clone(), pull.clone())));
        }
    }
    agents.push(Arc::new(AwarenessSweepAgent::new(msh.clone(), settings.awareness_sweep_interval())));
    agents.push(Arc::new(RetrySweepAgent::new(msh.clone(), settings.retry_sweep_interval())));
    agents
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running message service handler
pub struct RuntimeHandle {
    msh: Arc<Msh>,
    supervisor: Supervisor,
    shutdown_timeout: Duration,
}

impl RuntimeHandle {
    /// The handler, for receiving and submitting messages
    pub fn msh(&self) -> &Arc<Msh> {
        &self.msh
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub async fn health(&self) -> HashMap<String, AgentHealth> {
        self.supervisor.health().await
    }

    /// Wait until shutdown is requested through [`RuntimeHandle::shutdown_token`]
    pub async fn wait(&self) {
        self.supervisor.cancellation().cancelled().await;
    }

    /// Token that stops the agents when cancelled
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.supervisor.cancellation()
    }

    /// Stop the agents and wait for them
    pub async fn shutdown(self) -> MshResult<()> {
        let graceful = self.supervisor.shutdown(self.shutdown_timeout).await;
        info!(graceful, "Message service handler stopped");
        Ok(())
    }
}
