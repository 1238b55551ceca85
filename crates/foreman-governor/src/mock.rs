// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use async_trait::async_trait;

use crate::fitter::{SessionDispatcher, SessionRequest, SessionResponse};

/// [`SessionDispatcher`] for tests: records every request and returns either
/// a canned success or a scripted failure.
pub struct RecordingDispatcher {
    requests: Mutex<Vec<SessionRequest>>,
    failure: Option<String>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    /// A dispatcher whose `create_session` always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failure: Some(message.into()),
        }
    }

    /// All requests received so far, in call order.
    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionDispatcher for RecordingDispatcher {
    async fn create_session(&self, request: SessionRequest) -> anyhow::Result<SessionResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        Ok(SessionResponse {
            session_id: format!("fitter-{}", self.requests().len()),
            success: true,
            cost: 0.01,
            files_changed: Vec::new(),
            duration_ms: 1_000,
            error: None,
        })
    }
}
