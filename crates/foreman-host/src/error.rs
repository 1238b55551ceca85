// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    /// The target resource does not exist on the host (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("host returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode host response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event stream error: {0}")]
    Stream(String),
}

impl HostError {
    /// Whether this error means the resource is gone rather than the call
    /// having failed. Used by the kill path, which treats a missing session
    /// as already dead.
    pub fn is_not_found(&self) -> bool {
        match self {
            HostError::NotFound(_) => true,
            HostError::Api { status, .. } => *status == 404,
            HostError::Transport(e) => e.status().map(|s| s.as_u16() == 404).unwrap_or(false),
            _ => false,
        }
    }
}
