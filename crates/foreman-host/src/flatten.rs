// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use crate::types::{parse_time, FlatPart};

/// Normalize a message-history response into a flat part sequence.
///
/// The host has shipped two history shapes:
///
/// * nested: `[{ "info": {...}, "parts": [part, ...] }, ...]`, one group per
///   message, role and timestamp on the `info` object;
/// * flat: `[part, part, ...]`, role and timestamp on each part.
///
/// Both normalize to the same `FlatPart` sequence; nothing outside this
/// function may depend on which shape was received. Entries that are not
/// objects are skipped.
pub fn flatten_parts(history: &Value) -> Vec<FlatPart> {
    let Some(entries) = history.as_array() else {
        return Vec::new();
    };

    let mut flat = Vec::new();
    for entry in entries {
        if !entry.is_object() {
            continue;
        }
        match entry.get("parts").and_then(Value::as_array) {
            Some(parts) => {
                let info = entry.get("info");
                let role = info
                    .and_then(|i| i.get("role"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let group_ts = info.and_then(|i| i.get("time")).and_then(parse_time);
                for part in parts {
                    if let Some(mut p) = flatten_one(part) {
                        p.role = p.role.or_else(|| role.clone());
                        p.ts = p.ts.or(group_ts);
                        flat.push(p);
                    }
                }
            }
            None => {
                if let Some(p) = flatten_one(entry) {
                    flat.push(p);
                }
            }
        }
    }
    flat
}

fn flatten_one(part: &Value) -> Option<FlatPart> {
    let obj = part.as_object()?;
    let part_type = obj.get("type")?.as_str()?.to_string();

    let state = obj.get("state");
    let tokens = obj.get("tokens");

    Some(FlatPart {
        part_type,
        role: obj.get("role").and_then(Value::as_str).map(str::to_string),
        tool: obj.get("tool").and_then(Value::as_str).map(str::to_string),
        status: state
            .and_then(|s| s.get("status"))
            .and_then(Value::as_str)
            .map(str::to_string),
        error: state
            .and_then(|s| s.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string),
        content: obj
            .get("text")
            .or_else(|| obj.get("content"))
            .or_else(|| state.and_then(|s| s.get("output")))
            .and_then(Value::as_str)
            .map(str::to_string),
        cost: obj.get("cost").and_then(Value::as_f64),
        tokens_input: tokens.and_then(|t| t.get("input")).and_then(Value::as_i64),
        tokens_output: tokens.and_then(|t| t.get("output")).and_then(Value::as_i64),
        tokens_reasoning: tokens
            .and_then(|t| t.get("reasoning"))
            .and_then(Value::as_i64),
        ts: obj
            .get("time")
            .or_else(|| obj.get("timestamp"))
            .and_then(parse_time),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
