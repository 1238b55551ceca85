// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use foreman_core::HostEvent;

/// One entry from `GET /session`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "updatedAt", default, deserialize_with = "flexible_time")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt", default, deserialize_with = "flexible_time")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

/// One normalized message part, independent of which of the two history wire
/// shapes the host used. Everything downstream (diagnosis, catch-up) sees
/// only this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatPart {
    pub part_type: String,
    /// Role of the enclosing message, when the wire shape carried one.
    pub role: Option<String>,
    pub tool: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub content: Option<String>,
    pub cost: Option<f64>,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub tokens_reasoning: Option<i64>,
    pub ts: Option<DateTime<Utc>>,
}

impl FlatPart {
    pub fn is_tool(&self) -> bool {
        self.part_type == "tool"
    }

    pub fn is_text(&self) -> bool {
        self.part_type == "text"
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }

    /// Rebuild a `message.part.updated` event for replaying this part through
    /// the classifier. The shape is fixed field-by-field so the replayed
    /// event hashes identically on every catch-up run.
    pub fn to_event(&self, session_id: &str) -> HostEvent {
        let mut part = json!({
            "type": self.part_type,
            "sessionID": session_id,
        });
        if let Some(tool) = &self.tool {
            part["tool"] = json!(tool);
        }
        if self.status.is_some() || self.error.is_some() {
            let mut state = serde_json::Map::new();
            if let Some(status) = &self.status {
                state.insert("status".into(), json!(status));
            }
            if let Some(error) = &self.error {
                state.insert("error".into(), json!(error));
            }
            part["state"] = Value::Object(state);
        }
        if let Some(content) = &self.content {
            part["text"] = json!(content);
        }
        if let Some(cost) = self.cost {
            part["cost"] = json!(cost);
        }
        if self.tokens_input.is_some() || self.tokens_output.is_some() {
            part["tokens"] = json!({
                "input": self.tokens_input,
                "output": self.tokens_output,
                "reasoning": self.tokens_reasoning,
            });
        }
        HostEvent::new("message.part.updated", json!({ "part": part }))
    }
}

/// Accept either an RFC 3339 string or an epoch-milliseconds number; the
/// host has emitted both across versions.
fn flexible_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_time))
}

pub(crate) fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
