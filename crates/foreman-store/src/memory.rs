// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use foreman_core::{
    CardRequirement, MessageRecord, Punch, PunchType, SessionRecord, ToolCallRecord,
};

use crate::error::StoreError;
use crate::store::{like_match, Store};

/// In-memory [`Store`] with the same semantics as the PostgreSQL writer:
/// source-hash idempotency, dedup keys, `%` pattern matching, and the
/// connect-scope requirement. Used by unit and integration tests; also
/// handy as a scratch backend for replay experiments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    punches: Vec<Punch>,
    punch_hashes: BTreeSet<String>,
    sessions: BTreeMap<String, SessionRecord>,
    messages: Vec<MessageRecord>,
    message_keys: BTreeSet<(String, DateTime<Utc>, String)>,
    tool_calls: Vec<ToolCallRecord>,
    tool_call_keys: BTreeSet<(String, DateTime<Utc>, String)>,
    child_rels: BTreeSet<(String, String)>,
    cards: Vec<CardRequirement>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that is already inside a connect scope.
    pub fn connected() -> Self {
        let store = Self::default();
        store.inner.lock().unwrap_or_else(|e| e.into_inner()).connected = true;
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        let guard = self.lock();
        if !guard.connected {
            return Err(StoreError::NotConnected);
        }
        Ok(guard)
    }

    /// Seed a card requirement row (test fixture; production rows are written
    /// by the workflow layer directly into `punch_cards`).
    pub fn add_card_requirement(&self, requirement: CardRequirement) {
        self.lock().cards.push(requirement);
    }

    /// Snapshot of all persisted punches, in insertion order.
    pub fn punches(&self) -> Vec<Punch> {
        self.lock().punches.clone()
    }

    /// Snapshot of one session row, if present.
    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.lock().messages.clone()
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.lock().tool_calls.clone()
    }

    pub fn child_rels(&self) -> Vec<(String, String)> {
        self.lock().child_rels.iter().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.lock().connected = false;
        Ok(())
    }

    async fn write_punch(&self, punch: &Punch) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        if !inner.punch_hashes.insert(punch.source_hash.clone()) {
            return Ok(false);
        }
        inner.punches.push(punch.clone());
        Ok(true)
    }

    async fn write_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        inner
            .sessions
            .entry(session.session_id.clone())
            .and_modify(|existing| {
                existing.status = session.status.clone();
                existing.total_cost = session.total_cost;
                existing.tokens_in = session.tokens_in;
                existing.tokens_out = session.tokens_out;
                existing.tokens_reasoning = session.tokens_reasoning;
                existing.completed_at = session.completed_at;
                existing.outcome = session.outcome.clone();
            })
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn write_message(&self, message: &MessageRecord) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        let key = (
            message.session_id.clone(),
            message.ts,
            message.role.clone(),
        );
        if !inner.message_keys.insert(key) {
            return Ok(false);
        }
        inner.messages.push(message.clone());
        Ok(true)
    }

    async fn write_tool_call(&self, call: &ToolCallRecord) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        let key = (call.session_id.clone(), call.ts, call.tool_name.clone());
        if !inner.tool_call_keys.insert(key) {
            return Ok(false);
        }
        inner.tool_calls.push(call.clone());
        Ok(true)
    }

    async fn write_child_relation(&self, parent: &str, child: &str) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        Ok(inner
            .child_rels
            .insert((parent.to_string(), child.to_string())))
    }

    async fn sync_child_rels_from_punches(&self) -> Result<u64, StoreError> {
        let mut inner = self.locked()?;
        let edges: Vec<(String, String)> = inner
            .punches
            .iter()
            .filter(|p| {
                matches!(
                    p.punch_type,
                    PunchType::SessionLifecycle | PunchType::Workflow
                )
            })
            .filter_map(|p| {
                let child = p.punch_key.strip_prefix("child_spawned:")?;
                (!child.is_empty()).then(|| (p.task_id.clone(), child.to_string()))
            })
            .collect();

        let mut inserted = 0;
        for edge in edges {
            if inner.child_rels.insert(edge) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_punches(
        &self,
        task_id: &str,
        punch_type: PunchType,
        key_pattern: &str,
    ) -> Result<u64, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .punches
            .iter()
            .filter(|p| {
                p.task_id == task_id
                    && p.punch_type == punch_type
                    && like_match(key_pattern, &p.punch_key)
            })
            .count() as u64)
    }

    async fn card_requirements(&self, card_id: &str) -> Result<Vec<CardRequirement>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .cards
            .iter()
            .filter(|c| c.card_id == card_id)
            .cloned()
            .collect())
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .child_rels
            .iter()
            .filter(|(p, _)| p == parent_id)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
