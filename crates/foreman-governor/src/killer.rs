// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use foreman_core::{value_hash, Punch, PunchType};
use foreman_host::{AbortOutcome, HostApi};
use foreman_store::Store;

use crate::detector::{DetectorMetrics, LoopDetection};
use crate::error::GovernorError;

/// Proof that a session was stopped, handed to the diagnosis engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillConfirmation {
    pub session_id: String,
    pub killed_at: DateTime<Utc>,
    /// The detection that triggered the kill. When the session was already
    /// gone the reason carries a "(session was already terminated)" note.
    pub trigger: LoopDetection,
    pub final_metrics: DetectorMetrics,
}

pub struct SessionKiller {
    host: Arc<dyn HostApi>,
}

impl SessionKiller {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }

    /// Abort the detected session on the host and record the decision.
    ///
    /// A missing session (HTTP 404 or a transport-level not-found) degrades
    /// to success: the goal is "session is not running", and it isn't. With
    /// a store, exactly one `governor_kill` punch is recorded per logical
    /// kill; the punch hash is derived from the decision itself, so retries
    /// dedup. A store failure is logged and never fails the kill.
    pub async fn kill(
        &self,
        detection: &LoopDetection,
        store: Option<&dyn Store>,
    ) -> Result<KillConfirmation, GovernorError> {
        let session_id = &detection.session_id;

        let already_dead = match self.host.abort_session(session_id).await {
            Ok(AbortOutcome::Aborted) => false,
            Ok(AbortOutcome::AlreadyGone) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(e.into()),
        };

        info!(
            session_id,
            classification = %detection.classification,
            already_dead,
            "session killed: {}",
            detection.reason
        );

        if let Some(store) = store {
            let punch = kill_punch(detection);
            if let Err(e) = store.write_punch(&punch).await {
                warn!(session_id, error = %e, "could not record governor_kill punch");
            }
        }

        let mut trigger = detection.clone();
        if already_dead {
            trigger.reason.push_str(" (session was already terminated)");
        }

        Ok(KillConfirmation {
            session_id: session_id.clone(),
            killed_at: Utc::now(),
            trigger,
            final_metrics: detection.metrics,
        })
    }
}

/// The punch recording a kill decision. Hashed over the decision fields, not
/// the wall clock, so repeating the same kill mints the same punch.
fn kill_punch(detection: &LoopDetection) -> Punch {
    let source_hash = value_hash(&json!({
        "type": "governor_kill",
        "session_id": detection.session_id,
        "classification": detection.classification.as_str(),
        "step_count": detection.metrics.step_count,
        "total_cost": detection.metrics.total_cost,
    }));
    Punch {
        cost: Some(detection.metrics.total_cost),
        ..Punch::bare(
            detection.session_id.clone(),
            PunchType::GovernorKill,
            detection.classification.as_str(),
            source_hash,
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::LoopClassification;
    use foreman_host::MockHost;
    use foreman_store::MemoryStore;

    fn detection(session: &str) -> LoopDetection {
        LoopDetection {
            session_id: session.into(),
            classification: LoopClassification::ToolCycle,
            reason: "tool pattern [read, edit] repeated 3 times".into(),
            metrics: DetectorMetrics {
                step_count: 14,
                tool_call_count: 30,
                total_cost: 2.5,
            },
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn kill_aborts_and_records_punch() {
        let host = Arc::new(MockHost::new());
        let store = MemoryStore::connected();
        let killer = SessionKiller::new(host.clone());

        let confirmation = killer
            .kill(&detection("s1"), Some(&store))
            .await
            .unwrap();

        assert_eq!(host.aborted_sessions(), vec!["s1"]);
        assert_eq!(confirmation.session_id, "s1");
        assert!(!confirmation.trigger.reason.contains("already terminated"));

        let punches = store.punches();
        assert_eq!(punches.len(), 1);
        assert_eq!(punches[0].punch_type, PunchType::GovernorKill);
        assert_eq!(punches[0].punch_key, "tool_cycle");
        assert_eq!(punches[0].cost, Some(2.5));
    }

    #[tokio::test]
    async fn already_gone_session_degrades_to_success() {
        let host = Arc::new(MockHost::new());
        host.mark_gone("s1");
        let killer = SessionKiller::new(host);

        let confirmation = killer.kill(&detection("s1"), None).await.unwrap();
        assert!(confirmation
            .trigger
            .reason
            .ends_with("(session was already terminated)"));
        assert_eq!(confirmation.final_metrics.step_count, 14);
    }

    #[tokio::test]
    async fn repeated_kill_records_exactly_one_punch() {
        let host = Arc::new(MockHost::new());
        let store = MemoryStore::connected();
        let killer = SessionKiller::new(host);

        let d = detection("s1");
        killer.kill(&d, Some(&store)).await.unwrap();
        killer.kill(&d, Some(&store)).await.unwrap();

        assert_eq!(store.punches().len(), 1, "kill punch must dedup on retry");
    }

    #[tokio::test]
    async fn store_failure_does_not_fail_the_kill() {
        let host = Arc::new(MockHost::new());
        // Not connected: every write errors.
        let store = MemoryStore::new();
        let killer = SessionKiller::new(host);

        let confirmation = killer.kill(&detection("s1"), Some(&store)).await;
        assert!(confirmation.is_ok());
    }
}
