use serde::{Deserialize, Serialize};

use crate::events::SessionEvent;
use crate::types::SendEvent;

pub const PROTOCOL_VERSION: u32 = 1;

/// Broker-to-session control frames, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlFrame {
    Deliver(SendEvent),
    /// MCP tool-call ack forwarded by the broker, correlated by id.
    McpAck {
        delivery_id: String,
        status: String,
    },
    Ping {
        ts_ms: u64,
    },
    Shutdown {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Session-to-broker frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutFrame {
    Event(serde_json::Value),
    /// Raw child output for dashboards; not part of the delivery contract.
    Stream {
        chunk: String,
    },
    Pong {
        ts_ms: u64,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl OutFrame {
    pub fn event(event: &SessionEvent) -> Self {
        OutFrame::Event(serde_json::to_value(event).unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn deliver_frame_round_trip() {
        let frame = ControlFrame::Deliver(SendEvent {
            id: "abc123".into(),
            from: "Alice".into(),
            to: "Bob".into(),
            body: "Please review PR #42".into(),
            priority: Some(Priority::P2),
            thread_id: None,
        });
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: ControlFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn deliver_frame_defaults_optional_fields() {
        let raw = r##"{"type":"deliver","payload":{"id":"d1","from":"A","to":"#general","body":"hi"}}"##;
        let decoded: ControlFrame = serde_json::from_str(raw).unwrap();
        match decoded {
            ControlFrame::Deliver(event) => {
                assert_eq!(event.priority, None);
                assert_eq!(event.effective_priority(), Priority::P3);
                assert_eq!(event.thread_id, None);
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn mcp_ack_round_trip() {
        let frame = ControlFrame::McpAck {
            delivery_id: "d7".into(),
            status: "received".into(),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: ControlFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn shutdown_reason_is_optional() {
        let raw = r#"{"type":"shutdown","payload":{}}"#;
        let decoded: ControlFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded, ControlFrame::Shutdown { reason: None });
    }

    #[test]
    fn out_frame_wraps_session_events() {
        let frame = OutFrame::event(&SessionEvent::DeliveryQueued {
            delivery_id: "d1".into(),
            agent: "Bob".into(),
        });
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"delivery_queued\""));
        let decoded: OutFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn pong_round_trip() {
        let frame = OutFrame::Pong { ts_ms: 12345 };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: OutFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }
}
