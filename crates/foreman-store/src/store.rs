// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use foreman_core::{
    CardRequirement, MessageRecord, Punch, PunchType, SessionRecord, ToolCallRecord,
};

use crate::error::StoreError;

/// Persistence seam for punches and their companion records.
///
/// Every write is idempotent: replaying the same event sequence N times
/// leaves the same rows as a single run. The production implementation is
/// [`crate::PgStore`]; tests use [`crate::MemoryStore`], which mirrors every
/// semantic including `%` pattern matching and the dedup keys.
///
/// All operations other than `connect` fail with
/// [`StoreError::NotConnected`] outside a connect/disconnect scope.
#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Insert a punch unless a row with the same `source_hash` exists.
    /// Returns whether a row was actually inserted; a duplicate is not an
    /// error.
    async fn write_punch(&self, punch: &Punch) -> Result<bool, StoreError>;

    /// Upsert a session keyed by session id, overwriting mutable fields.
    async fn write_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Insert-if-not-exists on (session, ts, role).
    async fn write_message(&self, message: &MessageRecord) -> Result<bool, StoreError>;

    /// Insert-if-not-exists on (session, ts, tool_name).
    async fn write_tool_call(&self, call: &ToolCallRecord) -> Result<bool, StoreError>;

    /// Insert-if-not-exists parent→child edge.
    async fn write_child_relation(&self, parent: &str, child: &str) -> Result<bool, StoreError>;

    /// Scan lifecycle/workflow punches carrying `child_spawned:<id>` keys and
    /// insert any missing edges. Returns the number inserted.
    async fn sync_child_rels_from_punches(&self) -> Result<u64, StoreError>;

    /// Count punches for a task matching a type and a `%`-glob key pattern.
    async fn count_punches(
        &self,
        task_id: &str,
        punch_type: PunchType,
        key_pattern: &str,
    ) -> Result<u64, StoreError>;

    /// All requirement rows of a card, in insertion order.
    async fn card_requirements(&self, card_id: &str) -> Result<Vec<CardRequirement>, StoreError>;

    /// Child session ids recorded for a parent.
    async fn children_of(&self, parent_id: &str) -> Result<Vec<String>, StoreError>;
}

/// SQL-LIKE matching with `%` as the only wildcard, shared by the in-memory
/// store and tests so both backends agree on pattern semantics.
pub fn like_match(pattern: &str, value: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    let last = segments.len() - 1;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(seg) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(seg);
        } else {
            match rest.find(seg) {
                Some(pos) => rest = &rest[pos + seg.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '%': everything left over is matched by it.
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
