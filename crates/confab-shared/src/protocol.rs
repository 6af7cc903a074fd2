//! JSON socket wire protocol.
//!
//! Every frame on the wire is `{"type": ..., "body": {...}}` with
//! `type` one of `request`, `response`, `change`, `signal`. Server
//! originated frames additionally carry a monotonically increasing
//! `counter` and a `timestamp`, which drive gap detection and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::EntityKind;

/// Socket request methods understood by the server.
pub mod methods {
    /// Lightweight liveness probe; the response carries the server's
    /// current event counter.
    pub const COUNTER_READ: &str = "counter.read";
    /// Request a replay of all change packets since a timestamp.
    pub const EVENT_REPLAY: &str = "event.replay";
    /// Post a delivery/read receipt for a message.
    pub const RECEIPT_CREATE: &str = "receipt.create";
}

/// A complete wire frame: the tagged body plus the server-side
/// counter/timestamp pair (absent on client-originated frames).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Frame bodies, tagged by the envelope-level `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "lowercase")]
pub enum Frame {
    Request(RequestBody),
    Response(ResponseBody),
    Change(ChangeBody),
    Signal(SignalBody),
}

/// Outbound request needing a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub request_id: String,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound response echoing the request id it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
}

/// A server push describing one mutation of the object graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBody {
    pub operation: ChangeOperation,
    pub object: ObjectRef,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Delete,
    Patch,
}

/// Identifies the entity a change frame acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

/// Ephemeral signals that bypass the object cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalBody {
    TypingIndicator {
        object: SignalObject,
        data: TypingSignal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalObject {
    /// Conversation the signal is scoped to.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingSignal {
    pub action: TypingAction,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingAction {
    Started,
    Paused,
    Finished,
}

/// One step of a `patch` change: a verb applied to a (possibly nested,
/// dot-separated) property path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub operation: PatchVerb,
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Set instead of `value` when the operand is an entity reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchVerb {
    /// Assign a scalar or mapping value.
    Set,
    /// Remove a mapping key.
    Delete,
    /// Append to an array-valued field if not already present.
    Add,
    /// Remove from an array-valued field.
    Remove,
}

/// Payload of an [`methods::EVENT_REPLAY`] request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub from_timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a body into a client-originated frame (no counter).
    pub fn client(frame: Frame) -> Self {
        Self {
            frame,
            counter: None,
            timestamp: None,
        }
    }

    /// Build a request frame with a fresh locally unique request id.
    pub fn request(method: &str, data: Value) -> (Self, String) {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Self::client(Frame::Request(RequestBody {
            request_id: request_id.clone(),
            method: method.to_string(),
            data,
        }));
        (envelope, request_id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let (envelope, request_id) = Envelope::request(methods::COUNTER_READ, Value::Null);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "body": {
                    "request_id": request_id,
                    "method": "counter.read",
                    "data": null,
                }
            })
        );
    }

    #[test]
    fn test_change_frame_roundtrip() {
        let raw = json!({
            "type": "change",
            "counter": 42,
            "timestamp": "2026-01-05T10:00:00Z",
            "body": {
                "operation": "patch",
                "object": {
                    "id": "confab:///conversations/abc",
                    "type": "conversation",
                },
                "data": [
                    {"operation": "set", "property": "metadata.title", "value": "hello"},
                    {"operation": "add", "property": "participants", "id": "user-a"},
                ],
            }
        })
        .to_string();

        let envelope = Envelope::from_json(&raw).unwrap();
        assert_eq!(envelope.counter, Some(42));
        let Frame::Change(change) = &envelope.frame else {
            panic!("expected change frame");
        };
        assert_eq!(change.operation, ChangeOperation::Patch);
        assert_eq!(change.object.kind, EntityKind::Conversation);

        let ops: Vec<PatchOp> = serde_json::from_value(change.data.clone()).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].operation, PatchVerb::Set);
        assert_eq!(ops[1].id.as_deref(), Some("user-a"));

        let reencoded: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(reencoded, serde_json::from_str::<Value>(&raw).unwrap());
    }

    #[test]
    fn test_typing_signal_shape() {
        let envelope = Envelope::client(Frame::Signal(SignalBody::TypingIndicator {
            object: SignalObject {
                id: "confab:///conversations/abc".to_string(),
            },
            data: TypingSignal {
                action: TypingAction::Started,
                user_id: "user-a".to_string(),
            },
        }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "signal",
                "body": {
                    "type": "typing_indicator",
                    "object": {"id": "confab:///conversations/abc"},
                    "data": {"action": "started", "user_id": "user-a"},
                }
            })
        );
    }

    #[test]
    fn test_response_frame_parses() {
        let raw = json!({
            "type": "response",
            "counter": 7,
            "timestamp": "2026-01-05T10:00:01Z",
            "body": {"request_id": "r-1", "success": false, "data": {"code": "timeout"}},
        })
        .to_string();
        let envelope = Envelope::from_json(&raw).unwrap();
        let Frame::Response(response) = &envelope.frame else {
            panic!("expected response frame");
        };
        assert!(!response.success);
        assert_eq!(response.request_id, "r-1");
    }
}
