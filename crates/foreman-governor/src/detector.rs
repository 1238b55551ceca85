// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use foreman_core::{Punch, PunchType};

/// Why a session was judged to be looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopClassification {
    StepOverflow,
    CostOverflow,
    ToolCycle,
    CachePlateau,
}

impl LoopClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopClassification::StepOverflow => "step_overflow",
            LoopClassification::CostOverflow => "cost_overflow",
            LoopClassification::ToolCycle => "tool_cycle",
            LoopClassification::CachePlateau => "cache_plateau",
        }
    }
}

impl std::fmt::Display for LoopClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection thresholds. The defaults are the production values; tests and
/// config tighten them.
#[derive(Debug, Clone)]
pub struct DetectorThresholds {
    pub max_steps: u64,
    pub max_cost_usd: f64,
    pub min_cycle_length: usize,
    pub max_cycle_length: usize,
    pub cycle_repetitions: usize,
    pub cache_window_size: usize,
    pub cache_plateau_ratio: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_cost_usd: 10.0,
            min_cycle_length: 2,
            max_cycle_length: 6,
            cycle_repetitions: 3,
            cache_window_size: 20,
            cache_plateau_ratio: 0.3,
        }
    }
}

/// Counters snapshot attached to detections and kill confirmations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorMetrics {
    pub step_count: u64,
    pub tool_call_count: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetection {
    pub session_id: String,
    pub classification: LoopClassification,
    /// Human-readable explanation of what tripped.
    pub reason: String,
    pub metrics: DetectorMetrics,
    pub detected_at: DateTime<Utc>,
}

/// Per-session loop analyzer.
///
/// Pure and deterministic: two detectors fed the same punch sequence produce
/// the same detection (modulo `detected_at`); `ingest` and `detect` do no
/// I/O. One instance is owned by the task ingesting that session's punches.
pub struct LoopDetector {
    session_id: String,
    thresholds: DetectorThresholds,
    step_count: u64,
    tool_call_count: u64,
    tool_history: Vec<String>,
    hash_buffer: Vec<String>,
    total_cost: f64,
}

impl LoopDetector {
    pub fn new(session_id: impl Into<String>, thresholds: DetectorThresholds) -> Self {
        Self {
            session_id: session_id.into(),
            thresholds,
            step_count: 0,
            tool_call_count: 0,
            tool_history: Vec::new(),
            hash_buffer: Vec::new(),
            total_cost: 0.0,
        }
    }

    pub fn metrics(&self) -> DetectorMetrics {
        DetectorMetrics {
            step_count: self.step_count,
            tool_call_count: self.tool_call_count,
            total_cost: self.total_cost,
        }
    }

    /// Fold one punch into the session state.
    pub fn ingest(&mut self, punch: &Punch) {
        match punch.punch_type {
            // step_start_observed does not advance the step count; only a
            // finished step is progress.
            PunchType::StepComplete if punch.punch_key == "step_finished" => {
                self.step_count += 1;
            }
            PunchType::ToolCall => {
                self.tool_call_count += 1;
                self.tool_history.push(punch.punch_key.clone());
            }
            _ => {}
        }
        self.hash_buffer.push(
            punch
                .content_hash
                .clone()
                .unwrap_or_else(|| punch.source_hash.clone()),
        );
        self.total_cost += punch.cost.unwrap_or(0.0);
    }

    /// Evaluate the heuristics in priority order; the first to trip wins.
    pub fn detect(&self) -> Option<LoopDetection> {
        let t = &self.thresholds;

        if self.total_cost > t.max_cost_usd {
            return Some(self.detection(
                LoopClassification::CostOverflow,
                format!(
                    "total cost ${:.2} exceeded the ${:.2} budget",
                    self.total_cost, t.max_cost_usd
                ),
            ));
        }

        if self.step_count > t.max_steps {
            return Some(self.detection(
                LoopClassification::StepOverflow,
                format!(
                    "{} steps finished, limit is {}",
                    self.step_count, t.max_steps
                ),
            ));
        }

        if let Some(pattern) = self.find_tool_cycle() {
            return Some(self.detection(
                LoopClassification::ToolCycle,
                format!(
                    "tool pattern [{}] repeated {} times",
                    pattern.join(", "),
                    t.cycle_repetitions
                ),
            ));
        }

        if let Some(ratio) = self.cache_plateau_ratio() {
            return Some(self.detection(
                LoopClassification::CachePlateau,
                format!(
                    "only {:.0}% distinct content in the last {} observations",
                    ratio * 100.0,
                    t.cache_window_size
                ),
            ));
        }

        None
    }

    fn detection(&self, classification: LoopClassification, reason: String) -> LoopDetection {
        LoopDetection {
            session_id: self.session_id.clone(),
            classification,
            reason,
            metrics: self.metrics(),
            detected_at: Utc::now(),
        }
    }

    /// A cycle of length L exists when the final L x repetitions tool-history
    /// entries decompose into identical runs of length L. Shortest cycle
    /// first.
    fn find_tool_cycle(&self) -> Option<Vec<String>> {
        let t = &self.thresholds;
        for len in t.min_cycle_length..=t.max_cycle_length {
            let needed = len * t.cycle_repetitions;
            if self.tool_history.len() < needed {
                continue;
            }
            let tail = &self.tool_history[self.tool_history.len() - needed..];
            let pattern = &tail[..len];
            if tail.chunks(len).all(|run| run == pattern) {
                return Some(pattern.to_vec());
            }
        }
        None
    }

    /// Distinct-hash ratio over the trailing window, when it is below the
    /// plateau threshold.
    fn cache_plateau_ratio(&self) -> Option<f64> {
        let t = &self.thresholds;
        if self.hash_buffer.len() < t.cache_window_size {
            return None;
        }
        let window = &self.hash_buffer[self.hash_buffer.len() - t.cache_window_size..];
        let distinct: std::collections::HashSet<&str> =
            window.iter().map(String::as_str).collect();
        let ratio = distinct.len() as f64 / t.cache_window_size as f64;
        (ratio < t.cache_plateau_ratio).then_some(ratio)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
