// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::Serialize;

use crate::types::FlatPart;

/// Point-in-time summary of a session, computed from its flattened message
/// history. Built on the same normalized parts as diagnosis, so it never
/// touches the wire shape directly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub part_count: usize,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub text_parts: usize,
    pub total_cost: f64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    /// Most recent tool invoked, if any.
    pub last_tool: Option<String>,
    /// First 120 chars of the most recent text part.
    pub last_text: Option<String>,
}

impl SessionSnapshot {
    pub fn from_parts(session_id: &str, parts: &[FlatPart]) -> Self {
        const TEXT_PREVIEW_CHARS: usize = 120;
        let mut snapshot = SessionSnapshot {
            session_id: session_id.to_string(),
            part_count: parts.len(),
            ..Default::default()
        };
        for part in parts {
            snapshot.total_cost += part.cost.unwrap_or(0.0);
            snapshot.tokens_input += part.tokens_input.unwrap_or(0);
            snapshot.tokens_output += part.tokens_output.unwrap_or(0);
            if part.is_tool() {
                snapshot.tool_calls += 1;
                if part.is_error() {
                    snapshot.tool_errors += 1;
                }
                if let Some(tool) = &part.tool {
                    snapshot.last_tool = Some(tool.clone());
                }
            } else if part.is_text() {
                snapshot.text_parts += 1;
                if let Some(content) = &part.content {
                    snapshot.last_text =
                        Some(content.chars().take(TEXT_PREVIEW_CHARS).collect());
                }
            }
        }
        snapshot
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, status: &str, cost: f64) -> FlatPart {
        FlatPart {
            part_type: "tool".into(),
            tool: Some(name.into()),
            status: Some(status.into()),
            cost: Some(cost),
            ..Default::default()
        }
    }

    fn text(content: &str) -> FlatPart {
        FlatPart {
            part_type: "text".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_aggregates_counts_and_cost() {
        let parts = vec![
            tool("read", "completed", 0.1),
            tool("bash", "error", 0.2),
            text("working on it"),
        ];
        let snap = SessionSnapshot::from_parts("s1", &parts);
        assert_eq!(snap.part_count, 3);
        assert_eq!(snap.tool_calls, 2);
        assert_eq!(snap.tool_errors, 1);
        assert_eq!(snap.text_parts, 1);
        assert!((snap.total_cost - 0.3).abs() < 1e-9);
        assert_eq!(snap.last_tool.as_deref(), Some("bash"));
        assert_eq!(snap.last_text.as_deref(), Some("working on it"));
    }

    #[test]
    fn empty_history_gives_a_zeroed_snapshot() {
        let snap = SessionSnapshot::from_parts("s1", &[]);
        assert_eq!(snap.part_count, 0);
        assert!(snap.last_tool.is_none());
        assert!(snap.last_text.is_none());
    }

    #[test]
    fn long_text_is_previewed() {
        let long = "x".repeat(500);
        let snap = SessionSnapshot::from_parts("s1", &[text(&long)]);
        assert_eq!(snap.last_text.unwrap().len(), 120);
    }
}
