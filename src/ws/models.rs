use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::web::AppError;

/// The framed wire envelope: one JSON object per message, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireMessage {
    /// Builds an outbound frame stamped with the current time.
    pub fn outbound(message_type: &str, data: serde_json::Value) -> Self {
        WireMessage {
            message_type: message_type.to_string(),
            activation_code: None,
            data: Some(data),
            timestamp: Some(Utc::now().timestamp()),
            error: None,
        }
    }

    /// Builds a typed error frame for the originating connection.
    pub fn error_frame(message: &str) -> Self {
        WireMessage {
            message_type: "error".to_string(),
            activation_code: None,
            data: None,
            timestamp: Some(Utc::now().timestamp()),
            error: Some(message.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        // WireMessage contains only JSON-representable fields.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::Protocol(format!("invalid frame: {e}")))
    }
}

/// One device descriptor inside a `sync_line_accounts` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub external_id: String,
    pub platform_type: String,
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub profile_url: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub status_message: Option<String>,
    pub online_status: Option<String>,
}

/// Payload of an `incoming` frame: one contact event reported by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingPayload {
    pub device_external_id: String,
    pub contact_external_id: String,
    pub timestamp: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone_number: Option<String>,
}

/// Payload of an `account_status_change` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangePayload {
    pub device_external_id: String,
    pub online_status: String,
    pub timestamp: Option<String>,
}

/// Closed set of inbound message variants, decoded once the envelope's type
/// tag is known.
#[derive(Debug, Clone)]
pub enum Inbound {
    Heartbeat,
    SyncLineAccounts(Vec<DeviceDescriptor>),
    Incoming(IncomingPayload),
    CustomerSync(serde_json::Value),
    FollowUpSync(serde_json::Value),
    AccountStatusChange(StatusChangePayload),
}

impl Inbound {
    pub fn decode(envelope: &WireMessage) -> Result<Self, AppError> {
        match envelope.message_type.as_str() {
            "heartbeat" => Ok(Inbound::Heartbeat),
            "sync_line_accounts" => Ok(Inbound::SyncLineAccounts(required_data(envelope)?)),
            "incoming" => Ok(Inbound::Incoming(required_data(envelope)?)),
            "customer_sync" => Ok(Inbound::CustomerSync(
                envelope.data.clone().unwrap_or(serde_json::Value::Null),
            )),
            "follow_up_sync" => Ok(Inbound::FollowUpSync(
                envelope.data.clone().unwrap_or(serde_json::Value::Null),
            )),
            "account_status_change" => {
                Ok(Inbound::AccountStatusChange(required_data(envelope)?))
            }
            other => Err(AppError::UnknownMessageType(other.to_string())),
        }
    }
}

fn required_data<T: serde::de::DeserializeOwned>(envelope: &WireMessage) -> Result<T, AppError> {
    let data = envelope
        .data
        .clone()
        .ok_or_else(|| AppError::Protocol(format!("{}: missing data", envelope.message_type)))?;
    serde_json::from_value(data).map_err(|e| {
        AppError::Protocol(format!("{}: invalid data: {e}", envelope.message_type))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_heartbeat_without_data() {
        let envelope = WireMessage::decode(r#"{"type":"heartbeat","timestamp":1700000000}"#).unwrap();
        assert!(matches!(Inbound::decode(&envelope).unwrap(), Inbound::Heartbeat));
    }

    #[test]
    fn decodes_incoming_payload() {
        let raw = r#"{
            "type": "incoming",
            "activation_code": "ABCD1234",
            "data": {
                "device_external_id": "dev-1",
                "contact_external_id": "U123",
                "display_name": "Alice"
            }
        }"#;
        let envelope = WireMessage::decode(raw).unwrap();
        match Inbound::decode(&envelope).unwrap() {
            Inbound::Incoming(payload) => {
                assert_eq!(payload.device_external_id, "dev-1");
                assert_eq!(payload.contact_external_id, "U123");
                assert_eq!(payload.display_name.as_deref(), Some("Alice"));
                assert!(payload.phone_number.is_none());
            }
            other => panic!("expected incoming, got {other:?}"),
        }
    }

    #[test]
    fn decodes_sync_batch() {
        let raw = r#"{
            "type": "sync_line_accounts",
            "activation_code": "ABCD1234",
            "data": [
                {"external_id": "dev-1", "platform_type": "line", "online_status": "online"},
                {"external_id": "dev-2", "platform_type": "line_business"}
            ]
        }"#;
        let envelope = WireMessage::decode(raw).unwrap();
        match Inbound::decode(&envelope).unwrap() {
            Inbound::SyncLineAccounts(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[1].external_id, "dev-2");
            }
            other => panic!("expected sync batch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let envelope = WireMessage::decode(r#"{"type":"teleport"}"#).unwrap();
        assert!(matches!(
            Inbound::decode(&envelope),
            Err(AppError::UnknownMessageType(t)) if t == "teleport"
        ));
    }

    #[test]
    fn missing_data_is_a_protocol_error() {
        let envelope = WireMessage::decode(r#"{"type":"incoming"}"#).unwrap();
        assert!(matches!(Inbound::decode(&envelope), Err(AppError::Protocol(_))));
    }

    #[test]
    fn malformed_frame_is_a_protocol_error() {
        assert!(matches!(
            WireMessage::decode("not json"),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn outbound_envelope_shape() {
        let frame = WireMessage::outbound("heartbeat_ack", serde_json::json!({"status": "ok"}));
        let value: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], "heartbeat_ack");
        assert_eq!(value["data"]["status"], "ok");
        assert!(value.get("error").is_none());
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn error_frame_carries_only_the_error() {
        let frame = WireMessage::error_frame("activation code mismatch");
        let value: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "activation code mismatch");
        assert!(value.get("data").is_none());
    }
}
