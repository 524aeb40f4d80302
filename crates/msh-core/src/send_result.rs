//! Send-result classification
//!
//! Maps raw transport outcomes and deliver/notify failures onto the verdict
//! the reliability engines act on.

use serde::{Deserialize, Serialize};

use crate::errors::MshError;
use crate::external::TransportOutcome;

/// Verdict of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendResult {
    Success,
    RetryableFail,
    FatalFail,
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Success)
    }
}

/// Content types a partner may legitimately answer with
const RECOGNIZED_CONTENT_TYPES: &[&str] = &[
    "application/soap+xml",
    "multipart/related",
    "application/json",
    "text/xml",
];

fn is_recognized(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    RECOGNIZED_CONTENT_TYPES.contains(&media_type.as_str())
}

/// Classify the outcome of an HTTP send
pub fn classify(outcome: &TransportOutcome) -> SendResult {
    match outcome {
        TransportOutcome::Failed(error) if error.is_retryable() => SendResult::RetryableFail,
        TransportOutcome::Failed(_) => SendResult::FatalFail,
        TransportOutcome::Response {
            status,
            content_type,
            body,
        } => match *status {
            200..=299 => {
                let recognized = content_type.as_deref().map_or(false, is_recognized);
                if body.is_empty() || recognized {
                    SendResult::Success
                } else {
                    SendResult::FatalFail
                }
            }
            408 | 429 | 500..=599 => SendResult::RetryableFail,
            _ => SendResult::FatalFail,
        },
    }
}

/// Classify a deliver or notify failure
pub fn classify_error(error: &MshError) -> SendResult {
    if error.kind().is_retryable() {
        SendResult::RetryableFail
    } else {
        SendResult::FatalFail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    fn response(status: u16, content_type: Option<&str>, body: &[u8]) -> TransportOutcome {
        TransportOutcome::Response {
            status,
            content_type: content_type.map(str::to_string),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify(&response(202, None, b"")), SendResult::Success);
        assert_eq!(
            classify(&response(200, Some("application/soap+xml; charset=utf-8"), b"<x/>")),
            SendResult::Success
        );
        assert_eq!(classify(&response(200, Some("text/html"), b"<html/>")), SendResult::FatalFail);
        assert_eq!(classify(&response(503, None, b"")), SendResult::RetryableFail);
        assert_eq!(classify(&response(408, None, b"")), SendResult::RetryableFail);
        assert_eq!(classify(&response(429, None, b"")), SendResult::RetryableFail);
        assert_eq!(classify(&response(404, None, b"")), SendResult::FatalFail);
        assert_eq!(classify(&response(302, None, b"")), SendResult::FatalFail);
    }

    #[test]
    fn test_transport_failure_classification() {
        let timeout = TransportOutcome::Failed(TransportError::Timeout { duration_ms: 100 });
        assert_eq!(classify(&timeout), SendResult::RetryableFail);

        let tls = TransportOutcome::Failed(TransportError::Tls {
            reason: "expired".into(),
        });
        assert_eq!(classify(&tls), SendResult::FatalFail);
    }

    #[test]
    fn test_error_classification() {
        let transient = MshError::from(TransportError::Io { reason: "reset".into() });
        assert_eq!(classify_error(&transient), SendResult::RetryableFail);
        assert_eq!(
            classify_error(&MshError::config_error("no deliver target")),
            SendResult::FatalFail
        );
    }
}
