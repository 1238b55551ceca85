// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Startup catch-up: replay recently-updated sessions' persisted history
//! through the same classifier→writer path as live ingestion, so punches
//! missed while the daemon was down (or disconnected) are filled in. Every
//! write is idempotent, so re-running catch-up is safe.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use foreman_core::HostEvent;
use foreman_host::HostApi;
use foreman_store::Store;

use crate::ingest::{mirror_event, mirror_part, persist_event};

#[derive(Debug, Default, Clone, Copy)]
pub struct CatchupStats {
    pub sessions_replayed: usize,
    pub parts_replayed: usize,
    pub child_rels_recorded: usize,
    pub child_rels_synced: u64,
}

/// Replay all sessions updated within `window`.
///
/// An unreachable host is fatal here (the daemon cannot start blind); a
/// single session failing to replay is logged and skipped.
pub async fn run(
    host: &dyn HostApi,
    store: &dyn Store,
    window: Duration,
) -> anyhow::Result<CatchupStats> {
    let sessions = host
        .list_sessions()
        .await
        .map_err(|e| anyhow::anyhow!("listing sessions for catch-up: {e}"))?;

    let cutoff = Utc::now() - window;
    let mut stats = CatchupStats::default();

    for session in sessions {
        let recent = session.updated_at.map(|t| t >= cutoff).unwrap_or(false);
        if !recent {
            continue;
        }
        debug!(session_id = %session.id, "catching up session");
        stats.sessions_replayed += 1;

        // Lifecycle first, so a session row exists before its parts.
        let created = HostEvent::new("session.created", json!({"info": {"id": session.id}}));
        persist_event(store, &created).await;
        mirror_event(store, &created).await;

        if let Some(status) = &session.status {
            let updated = HostEvent::new(
                "session.updated",
                json!({"info": {"id": session.id, "status": status}}),
            );
            persist_event(store, &updated).await;
            mirror_event(store, &updated).await;
        }

        match host.list_messages(&session.id).await {
            Ok(parts) => {
                let session_start = session.created_at.unwrap_or(cutoff);
                for part in &parts {
                    persist_event(store, &part.to_event(&session.id)).await;
                    mirror_part(store, &session.id, part, session_start).await;
                    stats.parts_replayed += 1;
                }
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "history replay skipped");
            }
        }

        match host.list_children(&session.id).await {
            Ok(children) => {
                for child in children {
                    match store.write_child_relation(&session.id, &child).await {
                        Ok(inserted) => stats.child_rels_recorded += usize::from(inserted),
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "child relation write failed")
                        }
                    }
                }
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "child listing skipped"),
        }
    }

    // Fill any edges that only exist as spawn punches.
    match store.sync_child_rels_from_punches().await {
        Ok(n) => stats.child_rels_synced = n,
        Err(e) => warn!(error = %e, "child relation sync failed"),
    }

    info!(
        sessions = stats.sessions_replayed,
        parts = stats.parts_replayed,
        "catch-up complete"
    );
    Ok(stats)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
