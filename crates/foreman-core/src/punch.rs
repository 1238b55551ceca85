// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an observation record.
///
/// Stored as the snake_case string in the `punches` table, so the wire/DB
/// names are part of the contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchType {
    ToolCall,
    StepComplete,
    Message,
    SessionLifecycle,
    GovernorKill,
    Workflow,
    Governor,
}

impl PunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchType::ToolCall => "tool_call",
            PunchType::StepComplete => "step_complete",
            PunchType::Message => "message",
            PunchType::SessionLifecycle => "session_lifecycle",
            PunchType::GovernorKill => "governor_kill",
            PunchType::Workflow => "workflow",
            PunchType::Governor => "governor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(PunchType::ToolCall),
            "step_complete" => Some(PunchType::StepComplete),
            "message" => Some(PunchType::Message),
            "session_lifecycle" => Some(PunchType::SessionLifecycle),
            "governor_kill" => Some(PunchType::GovernorKill),
            "workflow" => Some(PunchType::Workflow),
            "governor" => Some(PunchType::Governor),
            _ => None,
        }
    }
}

impl std::fmt::Display for PunchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One idempotent observation minted from a host event.
///
/// `source_hash` is the primary idempotency key: any two logically
/// equivalent events (same type, deep-sorted-key-equal properties) hash to
/// the same value, and the punch table enforces uniqueness on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Punch {
    /// Opaque session identifier the observation belongs to.
    pub task_id: String,
    pub punch_type: PunchType,
    /// Discriminator within the type: tool name, `step_finished`,
    /// `session_completed`, a kill classification, ...
    pub punch_key: String,
    pub observed_at: DateTime<Utc>,
    /// 64-hex SHA-256 of the canonicalized originating event.
    pub source_hash: String,
    /// Hash of the content being processed (not the event envelope).
    /// Consumed by the cache-plateau heuristic.
    pub content_hash: Option<String>,
    pub cost: Option<f64>,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub tokens_reasoning: Option<i64>,
}

impl Punch {
    /// A punch with no metrics attached.
    pub fn bare(
        task_id: impl Into<String>,
        punch_type: PunchType,
        punch_key: impl Into<String>,
        source_hash: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            punch_type,
            punch_key: punch_key.into(),
            observed_at: Utc::now(),
            source_hash: source_hash.into(),
            content_hash: None,
            cost: None,
            tokens_input: None,
            tokens_output: None,
            tokens_reasoning: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punch_type_round_trips_through_strings() {
        for pt in [
            PunchType::ToolCall,
            PunchType::StepComplete,
            PunchType::Message,
            PunchType::SessionLifecycle,
            PunchType::GovernorKill,
            PunchType::Workflow,
            PunchType::Governor,
        ] {
            assert_eq!(PunchType::parse(pt.as_str()), Some(pt));
        }
    }

    #[test]
    fn punch_type_rejects_unknown_names() {
        assert_eq!(PunchType::parse("time_card"), None);
    }

    #[test]
    fn serde_names_match_db_names() {
        let json = serde_json::to_string(&PunchType::GovernorKill).unwrap();
        assert_eq!(json, "\"governor_kill\"");
    }

    #[test]
    fn bare_punch_has_no_metrics() {
        let p = Punch::bare("s1", PunchType::Message, "text_response", "ab".repeat(32));
        assert!(p.cost.is_none());
        assert!(p.content_hash.is_none());
        assert_eq!(p.task_id, "s1");
    }
}
