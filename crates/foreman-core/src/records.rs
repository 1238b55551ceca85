// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per agent session, keyed by session id. Mutable fields (status,
/// cost, tokens, completion) are overwritten on upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub task_id: Option<String>,
    pub mode: Option<String>,
    pub model: Option<String>,
    pub status: String,
    pub total_cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tokens_reasoning: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

/// One observed message. Deduplicated on (session, ts, role).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub session_id: String,
    pub role: String,
    pub content_type: String,
    pub content_preview: String,
    pub ts: DateTime<Utc>,
    pub cost: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
}

impl MessageRecord {
    /// Truncate a content body to the stored preview length.
    pub fn preview_of(content: &str) -> String {
        const PREVIEW_CHARS: usize = 200;
        content.chars().take(PREVIEW_CHARS).collect()
    }
}

/// One observed tool invocation. Deduplicated on (session, ts, tool_name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub session_id: String,
    pub tool_name: String,
    pub args_summary: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub cost: Option<f64>,
    pub ts: DateTime<Utc>,
}

/// Directed parent→child edge between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildRelation {
    pub parent_id: String,
    pub child_id: String,
}

/// One row of a punch card: a punch pattern a task must (or must not) have
/// produced. A card is the set of rows sharing a `card_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRequirement {
    pub card_id: String,
    pub punch_type: crate::punch::PunchType,
    /// SQL-LIKE style pattern over the punch key; `%` matches any run of
    /// characters.
    pub punch_key_pattern: String,
    pub required: bool,
    pub forbidden: bool,
    pub description: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
