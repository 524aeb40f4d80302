//! JSON message codec
//!
//! Structural encoding of the AS4 message model. Used for storing message
//! bodies and by deployments that exchange messages with a JSON-speaking
//! gateway; the SOAP/MIME envelope codec plugs in through the same trait.

use msh_core::{As4Message, EncodedMessage, MessageCodec, MshError, MshResult};

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type
            .split(';')
            .next()
            .map(|media_type| media_type.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
            .unwrap_or(false)
    }

    fn serialize(&self, message: &As4Message) -> MshResult<EncodedMessage> {
        Ok(EncodedMessage {
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: serde_json::to_vec(message)?,
        })
    }

    fn deserialize(&self, content_type: &str, body: &[u8]) -> MshResult<As4Message> {
        if !self.supports(content_type) {
            return Err(MshError::UnsupportedContentType {
                content_type: content_type.to_string(),
            });
        }
        serde_json::from_slice(body).map_err(|e| MshError::malformed(e.to_string()))
    }
}
