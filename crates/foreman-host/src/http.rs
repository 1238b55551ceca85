// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use foreman_core::HostEvent;

use crate::client::{AbortOutcome, EventStream, HostApi};
use crate::error::HostError;
use crate::flatten::flatten_parts;
use crate::types::{FlatPart, SessionInfo};

/// reqwest-backed [`HostApi`] implementation.
pub struct HttpHostClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHostClient {
    /// `base_url` is scheme://host:port with no trailing slash.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, HostError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(HostError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(HostError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl HostApi for HttpHostClient {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HostError> {
        let body = self.get_json("/session").await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<FlatPart>, HostError> {
        let body = self
            .get_json(&format!("/session/{session_id}/message"))
            .await?;
        Ok(flatten_parts(&body))
    }

    async fn list_children(&self, session_id: &str) -> Result<Vec<String>, HostError> {
        let body = self
            .get_json(&format!("/session/{session_id}/children"))
            .await?;
        let Some(entries) = body.as_array() else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter_map(|e| e.get("id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn abort_session(&self, session_id: &str) -> Result<AbortOutcome, HostError> {
        let url = format!("{}/session/{session_id}/abort", self.base_url);
        let resp = self.client.post(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(AbortOutcome::AlreadyGone);
        }
        if !status.is_success() {
            return Err(HostError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(AbortOutcome::Aborted)
    }

    async fn subscribe_events(&self) -> Result<EventStream, HostError> {
        let url = format!("{}/event", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HostError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        debug!(url, "event stream open");

        // SSE lines can be split across TCP chunks, so we carry a remainder
        // buffer forward. Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(HostError::Stream(
                            e.to_string(),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        // Non-JSON keepalives are dropped silently.
                        if let Ok(event) = serde_json::from_str::<HostEvent>(data) {
                            events.push(Ok(event));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_not_slash_terminated_twice() {
        let client = HttpHostClient::new("http://127.0.0.1:4096");
        assert_eq!(client.base_url, "http://127.0.0.1:4096");
    }
}
