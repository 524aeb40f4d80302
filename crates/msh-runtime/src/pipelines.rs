//! Pipeline assemblies

use std::sync::Arc;

use msh_core::{Pipeline, Step};

use crate::services::Services;
use crate::steps::*;

/// Inbound messages, pushed to us or returned by our own requests
pub fn receive_pipeline(services: &Arc<Services>) -> Pipeline {
    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(DeserializeMessage::new(services.clone())),
        Arc::new(DeterminePModes::new(services.clone())),
        Arc::new(VerifySignature::new(services.clone())),
        Arc::new(DecryptMessage::new(services.clone())),
        Arc::new(ValidateMessage),
        Arc::new(StoreReceivedMessage::new(services.clone())),
        Arc::new(SelectPullResponse::new(services.clone())),
        Arc::new(CreateReceipts::new(services.clone())),
        Arc::new(StoreOutboundSignals::new(services.clone())),
        Arc::new(SecurePullResponse::new(services.clone())),
        Arc::new(Respond::new(services.clone())),
    ];
    Pipeline::new("receive", steps)
}

/// Runs on the context of a failed receive
pub fn receive_error_pipeline(services: &Arc<Services>) -> Pipeline {
    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(CreateErrorSignal::new(services.clone())),
        Arc::new(StoreOutboundSignals::new(services.clone())),
        Arc::new(StoreInException::new(services.clone())),
        Arc::new(Respond::new(services.clone())),
    ];
    Pipeline::new("receive_error", steps)
}

/// Outbound user messages, signals and PullRequests
pub fn send_pipeline(services: &Arc<Services>) -> Pipeline {
    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(DynamicDiscoveryStep::new(services.clone())),
        Arc::new(BundlePullSignals::new(services.clone())),
        Arc::new(SignMessage::new(services.clone())),
        Arc::new(EncryptMessage::new(services.clone())),
        Arc::new(SendMessage::new(services.clone())),
    ];
    Pipeline::new("send", steps)
}
