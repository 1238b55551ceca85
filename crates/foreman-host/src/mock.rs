// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use foreman_core::HostEvent;

use crate::client::{AbortOutcome, EventStream, HostApi};
use crate::error::HostError;
use crate::types::{FlatPart, SessionInfo};

/// Scriptable [`HostApi`] for tests: seed sessions, histories, children and
/// SSE batches up front, then assert on the recorded abort calls afterwards.
/// Each `subscribe_events` call pops the next seeded batch, so a test can
/// model one connection per batch (and a reconnect between batches); when
/// the batches run out the stream is empty.
#[derive(Default)]
pub struct MockHost {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    sessions: Vec<SessionInfo>,
    messages: HashMap<String, Vec<FlatPart>>,
    children: HashMap<String, Vec<String>>,
    gone: HashSet<String>,
    fail_messages: HashSet<String>,
    aborted: Vec<String>,
    event_batches: VecDeque<Vec<HostEvent>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, info: SessionInfo) {
        self.lock().sessions.push(info);
    }

    pub fn set_messages(&self, session_id: &str, parts: Vec<FlatPart>) {
        self.lock().messages.insert(session_id.to_string(), parts);
    }

    /// Make `list_messages` fail for this session (history fetch fallback
    /// paths).
    pub fn fail_messages_for(&self, session_id: &str) {
        self.lock().fail_messages.insert(session_id.to_string());
    }

    pub fn set_children(&self, session_id: &str, children: Vec<String>) {
        self.lock().children.insert(session_id.to_string(), children);
    }

    /// Mark a session as already gone: aborts return
    /// [`AbortOutcome::AlreadyGone`].
    pub fn mark_gone(&self, session_id: &str) {
        self.lock().gone.insert(session_id.to_string());
    }

    /// Queue one SSE connection's worth of events.
    pub fn push_event_batch(&self, events: Vec<HostEvent>) {
        self.lock().event_batches.push_back(events);
    }

    /// Session ids abort was called for, in call order.
    pub fn aborted_sessions(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }
}

#[async_trait]
impl HostApi for MockHost {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HostError> {
        Ok(self.lock().sessions.clone())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<FlatPart>, HostError> {
        let state = self.lock();
        if state.fail_messages.contains(session_id) {
            return Err(HostError::Api {
                status: 500,
                body: "scripted failure".into(),
            });
        }
        Ok(state.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn list_children(&self, session_id: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .lock()
            .children
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn abort_session(&self, session_id: &str) -> Result<AbortOutcome, HostError> {
        let mut state = self.lock();
        state.aborted.push(session_id.to_string());
        if state.gone.contains(session_id) {
            Ok(AbortOutcome::AlreadyGone)
        } else {
            Ok(AbortOutcome::Aborted)
        }
    }

    async fn subscribe_events(&self) -> Result<EventStream, HostError> {
        let batch = self.lock().event_batches.pop_front().unwrap_or_default();
        Ok(futures::stream::iter(batch).map(Ok).boxed())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
