//! Command handlers and dispatch logic

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use msh_core::pmode::{InMemoryPModeStore, PModeScore};
use msh_core::reliability::RetrySweepReport;
use msh_core::{
    As4Message, Direction, InMemoryLedger, Ledger, ManualTimeSource, MessageCodec, MshConfig, Operation,
    PModeProvider, PModeResolver, ReceivedMessage, SignalMessage, Status, SweepReport, TimeSource, Transport,
    TransportOutcome, TransportRequest, UserMessage,
};
use msh_runtime::{Agent, JsonCodec, MshBuilder, SendAgent, JSON_CONTENT_TYPE};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute the given command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Check => Self::handle_check_command(&config),
            Commands::Resolve { message } => Self::handle_resolve_command(&config, &message),
            Commands::Sweep { fixture } => Self::handle_sweep_command(config, &fixture).await,
            Commands::ExampleConfig => {
                print!("{}", AppConfig::example_config());
                Ok(())
            }
        }
    }

    fn handle_check_command(config: &AppConfig) -> Result<()> {
        let summary = check_config(config)?;

        println!("Configuration OK");
        println!("Receiving PModes ({}):", summary.receiving.len());
        for id in &summary.receiving {
            println!("  {}", id);
        }
        println!("Sending PModes ({}):", summary.sending.len());
        for id in &summary.sending {
            println!("  {}", id);
        }
        if !summary.pull.is_empty() {
            println!("Pull agents ({}):", summary.pull.len());
            for pull in &summary.pull {
                println!("  {}", pull);
            }
        }
        Ok(())
    }

    fn handle_resolve_command(config: &AppConfig, message: &str) -> Result<()> {
        let user_message: UserMessage = serde_json::from_str(&read_json_argument(message)?)?;
        let report = resolve_message(&config.msh, &user_message)?;

        println!("Message {} (threshold {})", report.message_id, report.threshold);
        if report.scores.is_empty() {
            println!("  no receiving PModes configured");
        }
        for score in &report.scores {
            let marker = if report.selected.as_deref() == Some(score.pmode_id.as_str()) {
                "*"
            } else {
                " "
            };
            println!("{} {:>4}  {}", marker, score.score, score.pmode_id);
        }
        match (&report.selected, &report.failure) {
            (Some(selected), _) => println!("Selected PMode: {}", selected),
            (None, Some(failure)) => println!("No PMode selected: {}", failure),
            (None, None) => {}
        }
        Ok(())
    }

    async fn handle_sweep_command(config: AppConfig, fixture: &str) -> Result<()> {
        let fixture: SweepFixture = serde_json::from_str(&read_json_argument(fixture)?)?;
        let summary = run_sweep(config.msh, &fixture).await?;

        println!("Reception awareness sweep at {} ms", fixture.now_ms);
        println!("  completed:     {}", summary.awareness.completed);
        println!("  resends:       {}", summary.awareness.resends);
        println!("  dead-lettered: {}", summary.awareness.dead_lettered);
        println!("Retry sweep");
        println!("  requeued:      {}", summary.retries.requeued);
        println!("  completed:     {}", summary.retries.completed);
        println!("Messages");
        for state in &summary.messages {
            println!("  {:<36} {:?}/{:?}", state.message_id, state.operation, state.status);
        }
        Ok(())
    }
}

/// JSON given inline, or the contents of the file it names
fn read_json_argument(argument: &str) -> Result<String> {
    let trimmed = argument.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(argument.to_string());
    }
    if !Path::new(argument).exists() {
        return Err(CliError::Fixture(format!("{} is neither JSON nor an existing file", argument)));
    }
    Ok(std::fs::read_to_string(argument)?)
}

// ----------------------------------------------------------------------------
// Check
// ----------------------------------------------------------------------------

/// PModes and pull agents a configuration defines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub receiving: Vec<String>,
    pub sending: Vec<String>,
    pub pull: Vec<String>,
}

pub fn check_config(config: &AppConfig) -> Result<CheckSummary> {
    config.validate()?;
    let store = InMemoryPModeStore::from_config(&config.msh.pmodes)?;

    let mut receiving: Vec<String> = store.receiving_pmodes().iter().map(|p| p.id.clone()).collect();
    let mut sending: Vec<String> = store.sending_pmodes().iter().map(|p| p.id.clone()).collect();
    receiving.sort();
    sending.sort();
    let pull = config
        .msh
        .pull
        .iter()
        .map(|pull| format!("{} every {} ms", pull.sending_pmode_id, pull.interval_ms))
        .collect();

    Ok(CheckSummary {
        receiving,
        sending,
        pull,
    })
}

// ----------------------------------------------------------------------------
// Resolve
// ----------------------------------------------------------------------------

/// Outcome of a resolution dry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    pub message_id: String,
    pub threshold: u32,
    /// Every receiving PMode, highest score first
    pub scores: Vec<PModeScore>,
    pub selected: Option<String>,
    pub failure: Option<String>,
}

pub fn resolve_message(config: &MshConfig, message: &UserMessage) -> Result<ResolveReport> {
    let store = InMemoryPModeStore::from_config(&config.pmodes)?;
    let resolver = PModeResolver::new(config.resolver.clone());
    let pmodes = store.receiving_pmodes();

    let scores = resolver.resolve_with_scores(message, &pmodes);
    let (selected, failure) = match resolver.resolve(message, &pmodes) {
        Ok(pmode) => (Some(pmode.id.clone()), None),
        Err(e) => (None, Some(e.to_string())),
    };
    debug!(message_id = %message.message_id, ?selected, "Resolution dry run finished");

    Ok(ResolveReport {
        message_id: message.message_id.clone(),
        threshold: resolver.weights().threshold,
        scores,
        selected,
        failure,
    })
}

// ----------------------------------------------------------------------------
// Sweep
// ----------------------------------------------------------------------------

fn default_response_status() -> u16 {
    202
}

/// Outbound message replayed through the send path before the sweeps run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightMessage {
    pub pmode_id: String,
    pub message: UserMessage,
    /// Clock value at submission and send
    #[serde(default)]
    pub sent_at_ms: u64,
    /// HTTP status the partner answers the send with
    #[serde(default = "default_response_status")]
    pub response_status: u16,
    /// Whether a receipt came back after the send
    #[serde(default)]
    pub outcome: SendOutcomeFixture,
}

/// What the partner did after accepting a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcomeFixture {
    /// Nothing came back yet
    #[default]
    Unanswered,
    /// A receipt arrived
    Acknowledged,
}

/// Ledger state to sweep, described as the history that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFixture {
    /// Clock value the sweeps run at
    pub now_ms: u64,
    #[serde(default)]
    pub messages: Vec<InFlightMessage>,
}

/// Final state of one fixture message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    pub message_id: String,
    pub operation: Operation,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub awareness: SweepReport,
    pub retries: RetrySweepReport,
    pub messages: Vec<MessageState>,
}

/// Partner answering every message with the status its fixture scripts
struct FixtureTransport {
    statuses: HashMap<String, u16>,
}

impl FixtureTransport {
    fn new(fixture: &SweepFixture) -> Self {
        let statuses = fixture
            .messages
            .iter()
            .map(|m| (m.message.message_id.clone(), m.response_status))
            .collect();
        Self { statuses }
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn send(&self, request: TransportRequest) -> TransportOutcome {
        let status = JsonCodec
            .deserialize(&request.content_type, &request.body)
            .ok()
            .and_then(|message| {
                message
                    .primary_message_id()
                    .and_then(|id| self.statuses.get(id).copied())
            })
            .unwrap_or_else(default_response_status);

        TransportOutcome::Response {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// Replay the fixture against a fresh in-memory ledger, then sweep once
pub async fn run_sweep(config: MshConfig, fixture: &SweepFixture) -> Result<SweepSummary> {
    let clock = ManualTimeSource::new_at(0);
    let ledger = Arc::new(InMemoryLedger::new(Arc::new(clock.clone())));
    let msh = Arc::new(
        MshBuilder::new(config)
            .with_ledger(ledger.clone())
            .with_time_source(Arc::new(clock.clone()))
            .with_transport(Arc::new(FixtureTransport::new(fixture)))
            .build()?,
    );
    let sender = SendAgent::new(msh.clone(), Duration::from_millis(1), 1);
    let token = CancellationToken::new();

    let mut messages: Vec<&InFlightMessage> = fixture.messages.iter().collect();
    messages.sort_by_key(|m| m.sent_at_ms);

    for item in messages {
        clock.set(item.sent_at_ms);
        msh.submit(item.message.clone(), &item.pmode_id).await?;
        sender.poll_once(&token).await?;

        if item.outcome == SendOutcomeFixture::Acknowledged {
            let receipt = SignalMessage::receipt_for(&item.message, clock.now());
            let encoded = JsonCodec.serialize(&As4Message::from_signal(receipt))?;
            let response = msh
                .run_receive_pipeline(ReceivedMessage::new(JSON_CONTENT_TYPE, encoded.body))
                .await;
            debug!(
                message_id = %item.message.message_id,
                status = response.status_code,
                "Receipt replayed"
            );
        }
    }

    if fixture.now_ms < clock.now().as_millis() {
        return Err(CliError::Fixture(format!(
            "now_ms {} is before the last send",
            fixture.now_ms
        )));
    }
    clock.set(fixture.now_ms);

    let awareness = msh.sweep_reception_awareness().await?;
    let retries = msh.sweep_retries().await?;
    info!(?awareness, ?retries, "Sweeps finished");

    let mut states = Vec::new();
    for item in &fixture.messages {
        let records = ledger
            .find_by_message_id(Direction::Out, &item.message.message_id)
            .await?;
        if let Some(record) = records.iter().find(|r| !r.is_duplicate) {
            states.push(MessageState {
                message_id: record.ebms_message_id.clone(),
                operation: record.operation,
                status: record.status,
            });
        }
    }

    Ok(SweepSummary {
        awareness,
        retries,
        messages: states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use msh_core::pmode::{
        MessagePackaging, PModeCollaboration, PartyInfo, PushConfiguration, ReceptionAwarenessConfig,
        RetryConfig,
    };
    use msh_core::{Party, ReceivingPMode, SendingPMode, Service};

    const PARTNER_URL: &str = "https://partner.example.com/as4";

    fn user_message(id: &str) -> UserMessage {
        let mut user = UserMessage::new(
            Party::new("Sender", "org:sender"),
            Party::new("Receiver", "org:receiver"),
            Service::new("urn:services:invoice"),
            "Submit",
        );
        user.message_id = id.to_string();
        user
    }

    fn receiving_pmode(id: &str) -> ReceivingPMode {
        let mut pmode = ReceivingPMode::new(id);
        pmode.message_packaging = MessagePackaging {
            party_info: PartyInfo {
                from: Some(Party::new("Sender", "org:sender")),
                to: Some(Party::new("Receiver", "org:receiver")),
            },
            collaboration: PModeCollaboration {
                agreement_ref: None,
                service: Some(Service::new("urn:services:invoice")),
                action: Some("Submit".to_string()),
            },
            mpc: None,
        };
        pmode
    }

    fn push_pmode(id: &str) -> SendingPMode {
        let mut pmode = SendingPMode::new(id);
        pmode.push_configuration = Some(PushConfiguration {
            url: PARTNER_URL.to_string(),
            ..PushConfiguration::default()
        });
        pmode
    }

    fn config(receiving: Vec<ReceivingPMode>, sending: Vec<SendingPMode>) -> MshConfig {
        let mut config = MshConfig::testing();
        config.pmodes.receiving = receiving;
        config.pmodes.sending = sending;
        config
    }

    fn in_flight(id: &str, pmode_id: &str) -> InFlightMessage {
        InFlightMessage {
            pmode_id: pmode_id.to_string(),
            message: user_message(id),
            sent_at_ms: 0,
            response_status: 202,
            outcome: SendOutcomeFixture::Unanswered,
        }
    }

    #[test]
    fn test_check_lists_pmodes() {
        let app = AppConfig {
            msh: config(vec![receiving_pmode("b"), receiving_pmode("a")], vec![push_pmode("s")]),
            ..AppConfig::default()
        };
        let summary = check_config(&app).unwrap();
        assert_eq!(summary.receiving, vec!["a", "b"]);
        assert_eq!(summary.sending, vec!["s"]);
        assert!(summary.pull.is_empty());
    }

    #[test]
    fn test_resolve_selects_best_pmode() {
        let mut partial = receiving_pmode("partial");
        partial.message_packaging.collaboration.action = Some("Cancel".to_string());
        let config = config(vec![partial, receiving_pmode("exact")], Vec::new());

        let report = resolve_message(&config, &user_message("m-1")).unwrap();
        assert_eq!(report.selected.as_deref(), Some("exact"));
        assert!(report.failure.is_none());
        assert_eq!(report.scores.len(), 2);
        assert_eq!(report.scores[0].pmode_id, "exact");
        assert!(report.scores[0].score > report.scores[1].score);
    }

    #[test]
    fn test_resolve_reports_missing_match() {
        let config = config(vec![receiving_pmode("invoice")], Vec::new());
        let mut stranger = user_message("m-2");
        stranger.sender = Party::new("Buyer", "org:unknown");
        stranger.receiver = Party::new("Seller", "org:unknown");
        stranger.collaboration.service = Service::new("urn:services:other");
        stranger.collaboration.action = "Other".to_string();

        let report = resolve_message(&config, &stranger).unwrap();
        assert!(report.selected.is_none());
        assert!(report.failure.is_some());
        assert_eq!(report.scores[0].score, 0);
    }

    #[test]
    fn test_fixture_parses_from_json() {
        let fixture: SweepFixture = serde_json::from_str(
            r#"{
                "now_ms": 60000,
                "messages": [{
                    "pmode_id": "send-invoice",
                    "message": {
                        "message_id": "m-3",
                        "timestamp": 0,
                        "sender": {"role": "Sender", "party_ids": [{"id": "org:sender"}]},
                        "receiver": {"role": "Receiver", "party_ids": [{"id": "org:receiver"}]},
                        "collaboration": {"service": {"value": "urn:services:invoice"}, "action": "Submit"}
                    },
                    "outcome": "acknowledged"
                }]
            }"#,
        )
        .unwrap();

        let message = &fixture.messages[0];
        assert_eq!(message.response_status, 202);
        assert_eq!(message.outcome, SendOutcomeFixture::Acknowledged);
        assert_eq!(message.message.collaboration.action, "Submit");
    }

    #[tokio::test]
    async fn test_sweep_resends_unanswered_and_completes_acknowledged() {
        let mut pmode = push_pmode("aware");
        pmode.reliability.reception_awareness = ReceptionAwarenessConfig::enabled(2, Duration::from_secs(10));
        let mut acknowledged = in_flight("acked-1", "aware");
        acknowledged.outcome = SendOutcomeFixture::Acknowledged;
        let fixture = SweepFixture {
            now_ms: 10_000,
            messages: vec![in_flight("silent-1", "aware"), acknowledged],
        };

        let summary = run_sweep(config(Vec::new(), vec![pmode]), &fixture).await.unwrap();

        assert_eq!(summary.awareness.resends, 1);
        assert_eq!(summary.awareness.completed, 1);
        assert_eq!(summary.awareness.dead_lettered, 0);

        let silent = &summary.messages[0];
        assert_eq!(silent.message_id, "silent-1");
        assert_eq!(silent.operation, Operation::ToBeSent);

        let acked = &summary.messages[1];
        assert_eq!(acked.operation, Operation::Sent);
        assert_eq!(acked.status, Status::Ack);
    }

    #[tokio::test]
    async fn test_sweep_requeues_failed_send_after_backoff() {
        let mut pmode = push_pmode("retrying");
        pmode.reliability.retry = RetryConfig::fixed(2, Duration::from_secs(5));
        let mut failing = in_flight("failing-1", "retrying");
        failing.response_status = 503;

        let early = SweepFixture {
            now_ms: 1_000,
            messages: vec![failing.clone()],
        };
        let summary = run_sweep(config(Vec::new(), vec![pmode.clone()]), &early).await.unwrap();
        assert_eq!(summary.retries.requeued, 0);
        assert_eq!(summary.messages[0].operation, Operation::ToBeRetried);

        let due = SweepFixture {
            now_ms: 5_000,
            messages: vec![failing],
        };
        let summary = run_sweep(config(Vec::new(), vec![pmode]), &due).await.unwrap();
        assert_eq!(summary.retries.requeued, 1);
        assert_eq!(summary.messages[0].operation, Operation::ToBeSent);
    }

    #[tokio::test]
    async fn test_sweep_rejects_clock_before_sends() {
        let fixture = SweepFixture {
            now_ms: 0,
            messages: vec![InFlightMessage {
                sent_at_ms: 5_000,
                ..in_flight("late-1", "plain")
            }],
        };
        let result = run_sweep(config(Vec::new(), vec![push_pmode("plain")]), &fixture).await;
        assert!(matches!(result, Err(CliError::Fixture(_))));
    }

    #[test]
    fn test_inline_json_is_used_as_is() {
        assert_eq!(read_json_argument("{\"a\": 1}").unwrap(), "{\"a\": 1}");
        assert!(matches!(
            read_json_argument("/nonexistent/message.json"),
            Err(CliError::Fixture(_))
        ));
    }
}
