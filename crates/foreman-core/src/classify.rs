// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::event::{EventKind, HostEvent, Part};
use crate::hash::{event_source_hash, text_hash};
use crate::punch::{Punch, PunchType};

/// Classify a raw host event into at most one punch.
///
/// Total over all well-formed events: unrecognized shapes yield `None`,
/// never an error. The mapping is a fixed contract:
///
/// | event | punch |
/// |---|---|
/// | part `tool`, status completed/error | `tool_call` / tool name |
/// | part `step-start` | `step_complete` / `step_start_observed` |
/// | part `step-finish` | `step_complete` / `step_finished` (metrics) |
/// | part `text` | `message` / `text_response` |
/// | `session.updated`, status completed | `step_complete` / `session_completed` |
/// | `session.created\|deleted\|idle\|error` | `session_lifecycle` / `session_<suffix>` |
pub fn classify(event: &HostEvent) -> Option<Punch> {
    let task_id = event.task_id();
    let source_hash = event_source_hash(&event.event_type, &event.properties);

    match event.kind() {
        EventKind::PartUpdated { part } => classify_part(task_id, source_hash, part),
        EventKind::SessionUpdated { info } => {
            if info.status.as_deref() == Some("completed") {
                Some(Punch::bare(
                    task_id,
                    PunchType::StepComplete,
                    "session_completed",
                    source_hash,
                ))
            } else {
                None
            }
        }
        EventKind::SessionLifecycle { suffix, .. } => Some(Punch::bare(
            task_id,
            PunchType::SessionLifecycle,
            format!("session_{suffix}"),
            source_hash,
        )),
        EventKind::Unknown => None,
    }
}

fn classify_part(task_id: String, source_hash: String, part: Part) -> Option<Punch> {
    match part.part_type.as_str() {
        "tool" => {
            let status = part
                .state
                .as_ref()
                .and_then(|s| s.status.as_deref())
                .unwrap_or("");
            // Pending/running parts are not punched; only terminal states are
            // observations.
            if !matches!(status, "completed" | "error") {
                return None;
            }
            let key = part.tool.clone().unwrap_or_else(|| "unknown_tool".into());
            let content = part
                .state
                .as_ref()
                .and_then(|s| s.output.clone())
                .or_else(|| part.text.clone());
            Some(with_metrics(
                Punch {
                    content_hash: content.as_deref().map(text_hash),
                    ..Punch::bare(task_id, PunchType::ToolCall, key, source_hash)
                },
                &part,
            ))
        }
        "step-start" => Some(Punch::bare(
            task_id,
            PunchType::StepComplete,
            "step_start_observed",
            source_hash,
        )),
        "step-finish" => Some(with_metrics(
            Punch::bare(task_id, PunchType::StepComplete, "step_finished", source_hash),
            &part,
        )),
        "text" => Some(Punch {
            content_hash: part.text.as_deref().map(text_hash),
            ..Punch::bare(task_id, PunchType::Message, "text_response", source_hash)
        }),
        _ => None,
    }
}

fn with_metrics(mut punch: Punch, part: &Part) -> Punch {
    punch.cost = part.cost;
    if let Some(tokens) = part.tokens {
        punch.tokens_input = tokens.input;
        punch.tokens_output = tokens.output;
        punch.tokens_reasoning = tokens.reasoning;
    }
    punch
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
