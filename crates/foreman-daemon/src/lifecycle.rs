// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Daemon lifecycle.
//!
//! ```text
//! Initializing -> Connected -> CatchingUp -> Streaming
//!                                  ^            |  stream end / transport error
//!                                  |            v
//!                                  '----- Reconnecting   (capped exponential backoff)
//!
//! stop() at any point -> ShuttingDown -> Terminated
//! ```
//!
//! One cooperative consumer: events are processed strictly one at a time and
//! persistence back-pressures ingestion. The governor pipeline (kill,
//! diagnose, fitter) runs inline in the event-processing arm, outside any
//! cancellable future, so a shutdown never abandons a kill halfway.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use foreman_core::{HostEvent, PunchType};
use foreman_governor::{
    DetectorThresholds, DiagnosisEngine, FitterDispatch, FitterSettings, LoopDetection,
    LoopDetector, SessionDispatcher, SessionKiller,
};
use foreman_host::HostApi;
use foreman_store::Store;

use crate::backoff::Backoff;
use crate::catchup;
use crate::ingest::{mirror_event, persist_event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    Connected,
    CatchingUp,
    Streaming,
    Reconnecting,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub thresholds: DetectorThresholds,
    pub fitter: FitterSettings,
    pub catchup_window: chrono::Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            thresholds: DetectorThresholds::default(),
            fitter: FitterSettings::default(),
            catchup_window: chrono::Duration::hours(24),
        }
    }
}

impl DaemonOptions {
    pub fn from_config(config: &foreman_config::Config) -> Self {
        let g = &config.governor;
        let f = &config.fitter;
        Self {
            thresholds: DetectorThresholds {
                max_steps: g.max_steps,
                max_cost_usd: g.max_cost_usd,
                min_cycle_length: g.min_cycle_length,
                max_cycle_length: g.max_cycle_length,
                cycle_repetitions: g.cycle_repetitions,
                cache_window_size: g.cache_window_size,
                cache_plateau_ratio: g.cache_plateau_ratio,
            },
            fitter: FitterSettings {
                agent_mode: Some(f.agent_mode.clone()),
                recovery_model: f.recovery_model.clone(),
                token_budget: Some(f.token_budget),
                ms_per_dollar: f.ms_per_dollar,
                min_timeout_ms: f.min_timeout_ms,
                max_timeout_ms: f.max_timeout_ms,
                host_addr: config.host.addr.clone(),
                host_port: config.host.port,
            },
            catchup_window: chrono::Duration::hours(config.daemon.catchup_window_hours as i64),
        }
    }
}

/// Control handle held by the caller while [`Daemon::run`] is spawned.
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<DaemonState>,
}

impl DaemonHandle {
    /// Signal shutdown. The daemon exits at its next suspension point; an
    /// in-flight governor action completes first.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    /// Wait until the daemon reaches `target` (or the daemon is dropped).
    pub async fn wait_for(&mut self, target: DaemonState) {
        while *self.state_rx.borrow() != target {
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Daemon {
    host: Arc<dyn HostApi>,
    store: Arc<dyn Store>,
    killer: SessionKiller,
    diagnosis: DiagnosisEngine,
    fitter: FitterDispatch,
    options: DaemonOptions,
    detectors: HashMap<String, LoopDetector>,
    killed: HashSet<String>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<DaemonState>,
}

impl Daemon {
    pub fn new(
        host: Arc<dyn HostApi>,
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn SessionDispatcher>,
        options: DaemonOptions,
    ) -> (Self, DaemonHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(DaemonState::Initializing);
        let daemon = Self {
            killer: SessionKiller::new(host.clone()),
            diagnosis: DiagnosisEngine::new(host.clone()),
            fitter: FitterDispatch::new(dispatcher, options.fitter.clone()),
            host,
            store,
            options,
            detectors: HashMap::new(),
            killed: HashSet::new(),
            shutdown_rx,
            state_tx,
        };
        (
            daemon,
            DaemonHandle {
                shutdown_tx,
                state_rx,
            },
        )
    }

    fn set_state(&self, state: DaemonState) {
        let _ = self.state_tx.send(state);
    }

    fn should_stop(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until stopped. Only startup failures (store or host unreachable)
    /// return an error; everything after that is survived with logging and
    /// reconnects.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.store
            .connect()
            .await
            .context("connecting punch store")?;
        self.set_state(DaemonState::Connected);

        self.set_state(DaemonState::CatchingUp);
        catchup::run(
            self.host.as_ref(),
            self.store.as_ref(),
            self.options.catchup_window,
        )
        .await
        .context("catch-up replay")?;

        let mut backoff = Backoff::default();
        let mut shutdown = self.shutdown_rx.clone();

        'outer: while !self.should_stop() {
            self.set_state(DaemonState::Streaming);
            let mut stream = match self.host.subscribe_events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "event subscription failed");
                    if self.reconnect_sleep(&mut backoff, &mut shutdown).await {
                        break 'outer;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            // Runs outside the cancellable select arms: a
                            // stop() during a kill lets the kill finish.
                            self.process_event(&event).await;
                            backoff.reset();
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "event stream error");
                            break;
                        }
                        None => {
                            debug!("event stream ended");
                            break;
                        }
                    }
                }
            }

            if self.reconnect_sleep(&mut backoff, &mut shutdown).await {
                break 'outer;
            }
        }

        self.set_state(DaemonState::ShuttingDown);
        if let Err(e) = self.store.disconnect().await {
            warn!(error = %e, "store disconnect during shutdown");
        }
        self.set_state(DaemonState::Terminated);
        info!("daemon terminated");
        Ok(())
    }

    /// Sleep out the backoff delay. Returns true when shutdown was signalled
    /// instead.
    async fn reconnect_sleep(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if self.should_stop() {
            return true;
        }
        self.set_state(DaemonState::Reconnecting);
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn process_event(&mut self, event: &HostEvent) {
        let punch = persist_event(self.store.as_ref(), event).await;
        mirror_event(self.store.as_ref(), event).await;

        let Some(punch) = punch else { return };
        let task_id = punch.task_id.clone();
        if task_id == "unknown" {
            return;
        }

        if punch.punch_type == PunchType::StepComplete && punch.punch_key == "session_completed" {
            self.record_children(&task_id).await;
        }

        // Tee into the per-session detector. A session we already killed
        // stays killed; its stragglers are persisted but not re-analyzed.
        if self.killed.contains(&task_id) {
            return;
        }
        let detector = self.detectors.entry(task_id.clone()).or_insert_with(|| {
            LoopDetector::new(task_id.clone(), self.options.thresholds.clone())
        });
        detector.ingest(&punch);

        if let Some(detection) = detector.detect() {
            self.detectors.remove(&task_id);
            self.killed.insert(task_id);
            self.govern(detection).await;
        }
    }

    async fn record_children(&self, parent: &str) {
        match self.host.list_children(parent).await {
            Ok(children) => {
                for child in children {
                    if let Err(e) = self.store.write_child_relation(parent, &child).await {
                        warn!(session_id = parent, error = %e, "child relation write failed");
                    }
                }
            }
            Err(e) => warn!(session_id = parent, error = %e, "child listing failed"),
        }
    }

    /// Kill → diagnose → dispatch, for one tripped session. Failures are
    /// logged with the session id; the stream loop keeps going either way.
    async fn govern(&self, detection: LoopDetection) {
        info!(
            session_id = %detection.session_id,
            classification = %detection.classification,
            "loop detected: {}",
            detection.reason
        );

        let kill = match self
            .killer
            .kill(&detection, Some(self.store.as_ref()))
            .await
        {
            Ok(kill) => kill,
            Err(e) => {
                warn!(session_id = %detection.session_id, error = %e, "kill failed");
                return;
            }
        };

        let diagnosis = self.diagnosis.diagnose(&kill).await;
        info!(
            session_id = %diagnosis.session_id,
            category = %diagnosis.category,
            confidence = diagnosis.confidence,
            "diagnosis: {}",
            diagnosis.summary
        );

        let result = self.fitter.dispatch(&diagnosis, Some(&kill)).await;
        if result.success {
            info!(
                session_id = %detection.session_id,
                fitter_session = result.session_id.as_deref().unwrap_or("-"),
                "fitter dispatched"
            );
        } else {
            warn!(
                session_id = %detection.session_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "fitter dispatch failed"
            );
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
