// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw event as received from the host's SSE feed: a type string plus a
/// loosely shaped properties object. The properties value is kept verbatim
/// because the idempotency hash is computed over it; everything else decodes
/// through [`EventKind`] into typed payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl HostEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    /// Decode into the typed event taxonomy. Never fails: shapes that don't
    /// decode become [`EventKind::Unknown`].
    pub fn kind(&self) -> EventKind {
        EventKind::decode(self)
    }

    /// Session id carried by the event: `properties.part.sessionID` for part
    /// updates, `properties.info.id` for `session.*`, `"unknown"` otherwise.
    pub fn task_id(&self) -> String {
        if self.event_type == "message.part.updated" {
            if let Some(id) = self.properties["part"]["sessionID"].as_str() {
                return id.to_string();
            }
        } else if self.event_type.starts_with("session.") {
            if let Some(id) = self.properties["info"]["id"].as_str() {
                return id.to_string();
            }
        }
        "unknown".to_string()
    }
}

/// Typed view of the events the classifier cares about.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// `message.part.updated`: a message part changed state.
    PartUpdated { part: Part },
    /// `session.updated`: session status change.
    SessionUpdated { info: SessionRef },
    /// `session.created` / `session.deleted` / `session.idle` /
    /// `session.error`: lifecycle transitions keyed by the suffix.
    SessionLifecycle { suffix: String, info: SessionRef },
    /// Anything else. Not an error: unknown shapes mint no punch.
    Unknown,
}

impl EventKind {
    pub fn decode(event: &HostEvent) -> EventKind {
        match event.event_type.as_str() {
            "message.part.updated" => {
                let part: Part =
                    serde_json::from_value(event.properties["part"].clone()).unwrap_or_default();
                EventKind::PartUpdated { part }
            }
            "session.updated" => EventKind::SessionUpdated {
                info: decode_info(event),
            },
            other => match other.strip_prefix("session.") {
                Some(suffix @ ("created" | "deleted" | "idle" | "error")) => {
                    EventKind::SessionLifecycle {
                        suffix: suffix.to_string(),
                        info: decode_info(event),
                    }
                }
                _ => EventKind::Unknown,
            },
        }
    }
}

fn decode_info(event: &HostEvent) -> SessionRef {
    serde_json::from_value(event.properties["info"].clone()).unwrap_or_default()
}

/// The `info` object on `session.*` events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// One message part from a `message.part.updated` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Part {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub state: Option<PartState>,
    /// Text payload; the host emits either `text` or `content` here.
    #[serde(default, alias = "content")]
    pub text: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub tokens: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: Option<i64>,
    #[serde(default)]
    pub output: Option<i64>,
    #[serde(default)]
    pub reasoning: Option<i64>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_update_decodes_tool_fields() {
        let ev = HostEvent::new(
            "message.part.updated",
            json!({"part": {
                "type": "tool",
                "sessionID": "s1",
                "tool": "readFile",
                "state": {"status": "completed"},
                "cost": 0.02,
                "tokens": {"input": 100, "output": 20, "reasoning": 5},
            }}),
        );
        match ev.kind() {
            EventKind::PartUpdated { part } => {
                assert_eq!(part.part_type, "tool");
                assert_eq!(part.tool.as_deref(), Some("readFile"));
                assert_eq!(part.state.unwrap().status.as_deref(), Some("completed"));
                assert_eq!(part.cost, Some(0.02));
                assert_eq!(part.tokens.unwrap().reasoning, Some(5));
            }
            other => panic!("expected PartUpdated, got {other:?}"),
        }
    }

    #[test]
    fn text_part_accepts_content_alias() {
        let ev = HostEvent::new(
            "message.part.updated",
            json!({"part": {"type": "text", "sessionID": "s1", "content": "hello"}}),
        );
        match ev.kind() {
            EventKind::PartUpdated { part } => assert_eq!(part.text.as_deref(), Some("hello")),
            other => panic!("expected PartUpdated, got {other:?}"),
        }
    }

    #[test]
    fn session_lifecycle_suffixes_decode() {
        for suffix in ["created", "deleted", "idle", "error"] {
            let ev = HostEvent::new(
                format!("session.{suffix}"),
                json!({"info": {"id": "s9"}}),
            );
            match ev.kind() {
                EventKind::SessionLifecycle { suffix: s, info } => {
                    assert_eq!(s, suffix);
                    assert_eq!(info.id, "s9");
                }
                other => panic!("expected SessionLifecycle, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_event_types_decode_to_unknown() {
        let ev = HostEvent::new("server.heartbeat", json!({}));
        assert!(matches!(ev.kind(), EventKind::Unknown));
        // session.* with an unrecognized suffix is also unknown
        let ev = HostEvent::new("session.renamed", json!({"info": {"id": "x"}}));
        assert!(matches!(ev.kind(), EventKind::Unknown));
    }

    #[test]
    fn task_id_extraction_rules() {
        let part_ev = HostEvent::new(
            "message.part.updated",
            json!({"part": {"type": "text", "sessionID": "s1"}}),
        );
        assert_eq!(part_ev.task_id(), "s1");

        let session_ev = HostEvent::new("session.idle", json!({"info": {"id": "s2"}}));
        assert_eq!(session_ev.task_id(), "s2");

        let other = HostEvent::new("server.heartbeat", json!({}));
        assert_eq!(other.task_id(), "unknown");
    }

    #[test]
    fn malformed_part_decodes_to_defaults() {
        let ev = HostEvent::new("message.part.updated", json!({"part": "not-an-object"}));
        match ev.kind() {
            EventKind::PartUpdated { part } => assert_eq!(part.part_type, ""),
            other => panic!("expected PartUpdated, got {other:?}"),
        }
    }
}
