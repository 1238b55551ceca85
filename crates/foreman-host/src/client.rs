// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use foreman_core::HostEvent;

use crate::error::HostError;
use crate::types::{FlatPart, SessionInfo};

/// Live event feed from the host. Ends when the connection drops; the
/// consumer reconnects by calling [`HostApi::subscribe_events`] again.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<HostEvent, HostError>> + Send>>;

/// What happened to an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The host accepted the abort.
    Aborted,
    /// The session no longer exists on the host (404). Callers treat this
    /// as success with a note.
    AlreadyGone,
}

/// The agent-host API surface this control plane consumes.
///
/// The production implementation is [`crate::HttpHostClient`]; tests script
/// a [`crate::MockHost`].
#[async_trait]
pub trait HostApi: Send + Sync {
    /// `GET /session`: every session the host knows about.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HostError>;

    /// `GET /session/{id}/message`: full message history, normalized into
    /// flat parts regardless of which wire shape the host emitted.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<FlatPart>, HostError>;

    /// `GET /session/{id}/children`: ids of spawned child sessions.
    async fn list_children(&self, session_id: &str) -> Result<Vec<String>, HostError>;

    /// `POST /session/{id}/abort`. A 404 maps to [`AbortOutcome::AlreadyGone`]
    /// rather than an error.
    async fn abort_session(&self, session_id: &str) -> Result<AbortOutcome, HostError>;

    /// `SSE /event`: subscribe to the live feed.
    async fn subscribe_events(&self) -> Result<EventStream, HostError>;
}
