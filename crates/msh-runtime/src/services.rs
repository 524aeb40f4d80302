//! Shared collaborators
//!
//! Everything a step or agent needs, injected once and shared behind `Arc`s.

use async_trait::async_trait;
use std::sync::Arc;

use msh_core::config::ReceiveConfig;
use msh_core::errors::TransportError;
use msh_core::message::ErrorCode;
use msh_core::pmode::PModeResolver;
use msh_core::{
    As4Message, Deliverer, DynamicDiscovery, Ledger, MessageBodyStore, MessageCodec, MshError, MshResult,
    Notifier, PModeProvider, PullBundlingService, ReceptionAwarenessEngine, RetryEngine, SecurityProvider,
    TimeSource, Transport, TransportOutcome, TransportRequest,
};

/// Collaborators of one message service handler instance
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn Ledger>,
    pub bodies: Arc<dyn MessageBodyStore>,
    pub codec: Arc<dyn MessageCodec>,
    pub security: Arc<dyn SecurityProvider>,
    pub transport: Arc<dyn Transport>,
    pub discovery: Option<Arc<dyn DynamicDiscovery>>,
    pub deliverer: Option<Arc<dyn Deliverer>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub pmodes: Arc<dyn PModeProvider>,
    pub resolver: Arc<PModeResolver>,
    pub time_source: Arc<dyn TimeSource>,
    pub awareness: Arc<ReceptionAwarenessEngine>,
    pub retry: Arc<RetryEngine>,
    pub pull: Arc<PullBundlingService>,
    pub receive: ReceiveConfig,
}

impl Services {
    /// Serialize a message and store its body, returning the body location
    pub async fn store_body(&self, ebms_message_id: &str, message: &As4Message) -> MshResult<String> {
        let encoded = self.codec.serialize(message)?;
        Ok(self.bodies.save(ebms_message_id, &encoded.body).await?)
    }

    /// Load and decode a stored message body
    pub async fn load_message(&self, location: &str) -> MshResult<As4Message> {
        let body = self.bodies.load(location).await?;
        self.codec.deserialize(self.codec.content_type(), &body)
    }
}

// ----------------------------------------------------------------------------
// Stand-ins
// ----------------------------------------------------------------------------

/// Security provider for deployments without message-level security
///
/// Unsigned and unencrypted messages pass; anything that needs a key fails
/// with a policy error instead of silently skipping the operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

#[async_trait]
impl SecurityProvider for NoSecurity {
    async fn sign(&self, _message: As4Message, _certificate_ref: Option<&str>) -> MshResult<As4Message> {
        Err(MshError::config_error("Signing requested but no security provider is configured"))
    }

    async fn verify(&self, message: &As4Message) -> MshResult<()> {
        if message.is_signed {
            return Err(MshError::security_failure(
                ErrorCode::PolicyNoncompliance,
                "Signed message received but no security provider is configured",
            ));
        }
        Ok(())
    }

    async fn encrypt(&self, _message: As4Message, _public_key_ref: Option<&str>) -> MshResult<As4Message> {
        Err(MshError::config_error("Encryption requested but no security provider is configured"))
    }

    async fn decrypt(&self, message: As4Message, _certificate_ref: Option<&str>) -> MshResult<As4Message> {
        if message.is_encrypted {
            return Err(MshError::security_failure(
                ErrorCode::FailedDecryption,
                "Encrypted message received but no security provider is configured",
            ));
        }
        Ok(message)
    }
}

/// Transport for receive-only deployments; every send fails fatally
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

#[async_trait]
impl Transport for NoTransport {
    async fn send(&self, request: TransportRequest) -> TransportOutcome {
        TransportOutcome::Failed(TransportError::InvalidConfiguration {
            reason: format!("No transport configured to reach {}", request.url),
        })
    }
}
