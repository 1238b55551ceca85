// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Shared classifier→writer path used by both live ingestion and catch-up.
//!
//! Alongside the punch itself, recognizable events are mirrored into the
//! session/message/tool-call companion tables so queries don't have to
//! reconstruct them from punches.

use chrono::{DateTime, Utc};
use tracing::warn;

use foreman_core::{
    classify, EventKind, HostEvent, MessageRecord, Punch, SessionRecord, ToolCallRecord,
};
use foreman_host::FlatPart;
use foreman_store::Store;

/// Classify one event and persist the resulting punch, if any. Store
/// failures are logged with the session id and swallowed; ingestion must
/// outlive a flaky database.
pub async fn persist_event(store: &dyn Store, event: &HostEvent) -> Option<Punch> {
    let punch = classify(event);

    if let Some(punch) = &punch {
        if let Err(e) = store.write_punch(punch).await {
            warn!(task_id = %punch.task_id, error = %e, "punch write failed");
        }
    }
    punch
}

/// Update companion tables from the typed view of the event. Live ingestion
/// calls this beside [`persist_event`]; catch-up mirrors parts itself with
/// their historical timestamps so the dedup keys stay stable across runs.
pub async fn mirror_event(store: &dyn Store, event: &HostEvent) {
    let session_id = event.task_id();
    if session_id == "unknown" {
        return;
    }

    match event.kind() {
        EventKind::PartUpdated { part } => {
            let flat = FlatPart {
                part_type: part.part_type.clone(),
                role: None,
                tool: part.tool.clone(),
                status: part.state.as_ref().and_then(|s| s.status.clone()),
                error: part.state.as_ref().and_then(|s| s.error.clone()),
                content: part
                    .state
                    .as_ref()
                    .and_then(|s| s.output.clone())
                    .or_else(|| part.text.clone()),
                cost: part.cost,
                tokens_input: part.tokens.and_then(|t| t.input),
                tokens_output: part.tokens.and_then(|t| t.output),
                tokens_reasoning: part.tokens.and_then(|t| t.reasoning),
                ts: None,
            };
            mirror_part(store, &session_id, &flat, Utc::now()).await;
        }
        EventKind::SessionUpdated { info } => {
            if info.status.as_deref() == Some("completed") {
                let record = SessionRecord {
                    session_id: session_id.clone(),
                    status: "completed".into(),
                    completed_at: Some(Utc::now()),
                    outcome: Some("completed".into()),
                    ..Default::default()
                };
                write_session_logged(store, &record).await;
            }
        }
        EventKind::SessionLifecycle { suffix, .. } => {
            let status = match suffix.as_str() {
                "created" => "running",
                "idle" => "idle",
                "error" => "failed",
                "deleted" => "deleted",
                other => other,
            };
            let record = SessionRecord {
                session_id: session_id.clone(),
                status: status.into(),
                started_at: (status == "running").then(Utc::now),
                ..Default::default()
            };
            write_session_logged(store, &record).await;
        }
        EventKind::Unknown => {}
    }
}

/// Mirror one message part into the message/tool-call tables. `fallback_ts`
/// is used when the part carries no timestamp of its own (live events);
/// catch-up passes the part's historical timestamp for stable dedup keys.
pub async fn mirror_part(
    store: &dyn Store,
    session_id: &str,
    part: &FlatPart,
    fallback_ts: DateTime<Utc>,
) {
    let ts = part.ts.unwrap_or(fallback_ts);

    if part.is_tool() {
        // Terminal states only; a running tool call is not yet a record.
        if !matches!(part.status.as_deref(), Some("completed") | Some("error")) {
            return;
        }
        let record = ToolCallRecord {
            session_id: session_id.to_string(),
            tool_name: part.tool.clone().unwrap_or_else(|| "unknown_tool".into()),
            args_summary: None,
            status: part.status.clone(),
            error: part.error.clone(),
            duration_ms: None,
            cost: part.cost,
            ts,
        };
        if let Err(e) = store.write_tool_call(&record).await {
            warn!(session_id, error = %e, "tool-call record write failed");
        }
    } else if part.is_text() {
        let content = part.content.as_deref().unwrap_or_default();
        let record = MessageRecord {
            session_id: session_id.to_string(),
            role: part.role.clone().unwrap_or_else(|| "assistant".into()),
            content_type: "text".into(),
            content_preview: MessageRecord::preview_of(content),
            ts,
            cost: part.cost,
            tokens_in: part.tokens_input,
            tokens_out: part.tokens_output,
        };
        if let Err(e) = store.write_message(&record).await {
            warn!(session_id, error = %e, "message record write failed");
        }
    }
}

async fn write_session_logged(store: &dyn Store, record: &SessionRecord) {
    if let Err(e) = store.write_session(record).await {
        warn!(session_id = %record.session_id, error = %e, "session record write failed");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
