//! API Models
//!
//! Response bodies documented with `utoipa`, plus the inbound shape of
//! Telnyx call-control webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

/// Returned once Telnyx accepted an outbound call.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct CallPlaced {
    #[schema(example = "calling")]
    pub status: String,
    pub call_control_id: String,
    /// Display name of the scenario the patient will play.
    pub scenario: String,
    pub placed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ScenarioSummary {
    pub index: usize,
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct Health {
    #[schema(example = "ok")]
    pub status: String,
    pub scenarios: usize,
    /// Calls placed by this process that have not ended yet.
    pub active_calls: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct WebhookAck {
    #[schema(example = "ok")]
    pub status: String,
}

impl WebhookAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// A Telnyx call-control notification. Every field is optional on the wire,
/// so a webhook we do not understand still deserializes and gets acknowledged.
#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct TelnyxWebhook {
    #[serde(default)]
    pub data: WebhookData,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct WebhookData {
    #[serde(default)]
    #[schema(example = "call.answered")]
    pub event_type: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct WebhookPayload {
    #[serde(default)]
    pub call_control_id: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub hangup_cause: Option<String>,
}

/// The call-control events the service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    CallInitiated,
    CallAnswered,
    CallHangup,
    StreamingStarted,
    StreamingStopped,
    Other,
}

impl From<&str> for WebhookEvent {
    fn from(event_type: &str) -> Self {
        match event_type {
            "call.initiated" => Self::CallInitiated,
            "call.answered" => Self::CallAnswered,
            "call.hangup" => Self::CallHangup,
            "streaming.started" => Self::StreamingStarted,
            "streaming.stopped" => Self::StreamingStopped,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_parses_telnyx_envelope() {
        let raw = r#"{
            "data": {
                "event_type": "call.hangup",
                "id": "0ccc7b54",
                "occurred_at": "2026-01-01T00:00:00Z",
                "payload": {
                    "call_control_id": "v3:abc",
                    "to": "+15550002222",
                    "from": "+15550001111",
                    "hangup_cause": "normal_clearing"
                },
                "record_type": "event"
            },
            "meta": {"attempt": 1}
        }"#;
        let hook: TelnyxWebhook = serde_json::from_str(raw).unwrap();
        assert_eq!(
            WebhookEvent::from(hook.data.event_type.as_str()),
            WebhookEvent::CallHangup
        );
        assert_eq!(hook.data.payload.call_control_id, "v3:abc");
        assert_eq!(hook.data.payload.hangup_cause.as_deref(), Some("normal_clearing"));
    }

    #[test]
    fn test_webhook_tolerates_missing_fields() {
        let hook: TelnyxWebhook = serde_json::from_str("{}").unwrap();
        assert_eq!(hook.data.event_type, "");
        assert_eq!(WebhookEvent::from(""), WebhookEvent::Other);
        assert!(hook.data.payload.call_control_id.is_empty());
    }
}
