// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Failure-mode classification for killed sessions.
//!
//! Five independent classifiers each look at the session's flattened message
//! history (and the kill trigger) and may nominate a category with a
//! confidence. The highest confidence wins; ties fall to the evaluation
//! order below. When nothing matches, a low-confidence `model_confusion`
//! fallback keeps the recovery pipeline moving.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use foreman_host::{FlatPart, HostApi};

use crate::detector::LoopClassification;
use crate::killer::KillConfirmation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisCategory {
    StuckOnApproval,
    InfiniteRetry,
    ScopeCreep,
    ContextExhaustion,
    ModelConfusion,
}

impl DiagnosisCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisCategory::StuckOnApproval => "stuck_on_approval",
            DiagnosisCategory::InfiniteRetry => "infinite_retry",
            DiagnosisCategory::ScopeCreep => "scope_creep",
            DiagnosisCategory::ContextExhaustion => "context_exhaustion",
            DiagnosisCategory::ModelConfusion => "model_confusion",
        }
    }
}

impl std::fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated activity of one tool across the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPattern {
    pub tool: String,
    pub count: u64,
    pub error_count: u64,
    pub last_status: Option<String>,
}

impl ToolPattern {
    pub fn error_ratio(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.count as f64
    }
}

/// One classifier's nomination.
#[derive(Debug, Clone)]
struct Finding {
    category: DiagnosisCategory,
    confidence: f64,
    summary: String,
    suggested_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub session_id: String,
    pub diagnosed_at: DateTime<Utc>,
    pub category: DiagnosisCategory,
    pub confidence: f64,
    pub summary: String,
    pub suggested_action: String,
    pub tool_patterns: Vec<ToolPattern>,
}

pub struct DiagnosisEngine {
    host: Arc<dyn HostApi>,
}

impl DiagnosisEngine {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }

    /// Diagnose a killed session. Infallible: a failed history fetch
    /// degrades to empty parts and the classifier fallback takes over.
    pub async fn diagnose(&self, kill: &KillConfirmation) -> DiagnosisReport {
        let parts = match self.host.list_messages(&kill.session_id).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session_id = %kill.session_id, error = %e,
                      "history fetch failed, diagnosing on empty parts");
                Vec::new()
            }
        };
        diagnose_parts(kill, &parts)
    }
}

/// Pure diagnosis over already-fetched parts.
pub fn diagnose_parts(kill: &KillConfirmation, parts: &[FlatPart]) -> DiagnosisReport {
    let patterns = tool_patterns(parts);

    // Evaluation order is the tiebreak order.
    let findings = [
        stuck_on_approval(parts),
        infinite_retry(parts, &patterns),
        context_exhaustion(kill, &patterns),
        scope_creep(&patterns),
        model_confusion(parts, &patterns),
    ];

    let mut best: Option<Finding> = None;
    for finding in findings.into_iter().flatten() {
        let better = match &best {
            Some(current) => finding.confidence > current.confidence,
            None => true,
        };
        if better {
            best = Some(finding);
        }
    }

    let chosen = best.unwrap_or(Finding {
        category: DiagnosisCategory::ModelConfusion,
        confidence: 0.30,
        summary: "Unable to classify failure; defaulting to model_confusion".into(),
        suggested_action: "Re-dispatch with a simplified prompt and a different model".into(),
    });

    DiagnosisReport {
        session_id: kill.session_id.clone(),
        diagnosed_at: Utc::now(),
        category: chosen.category,
        confidence: chosen.confidence,
        summary: chosen.summary,
        suggested_action: chosen.suggested_action,
        tool_patterns: patterns,
    }
}

/// One record per distinct tool, in order of first appearance.
pub fn tool_patterns(parts: &[FlatPart]) -> Vec<ToolPattern> {
    let mut patterns: Vec<ToolPattern> = Vec::new();
    for part in parts.iter().filter(|p| p.is_tool()) {
        let Some(tool) = part.tool.as_deref() else {
            continue;
        };
        let is_error = part.is_error();
        match patterns.iter_mut().find(|p| p.tool == tool) {
            Some(pattern) => {
                pattern.count += 1;
                pattern.error_count += u64::from(is_error);
                pattern.last_status = part.status.clone();
            }
            None => patterns.push(ToolPattern {
                tool: tool.to_string(),
                count: 1,
                error_count: u64::from(is_error),
                last_status: part.status.clone(),
            }),
        }
    }
    patterns
}

// ── Classifiers ───────────────────────────────────────────────────────────────

const APPROVAL_KEYWORDS: &[&str] = &["permission", "approve", "confirm", "proceed", "allow"];

fn stuck_on_approval(parts: &[FlatPart]) -> Option<Finding> {
    let tail: Vec<&FlatPart> = parts.iter().rev().take(10).collect();
    if tail.is_empty() {
        return None;
    }
    let text_count = tail.iter().filter(|p| p.is_text()).count();
    let tool_count = tail.iter().filter(|p| p.is_tool()).count();

    if text_count >= 7 && tool_count == 0 {
        return Some(Finding {
            category: DiagnosisCategory::StuckOnApproval,
            confidence: 0.75,
            summary: "Session produced only text with no tool activity; it appears \
                      to be waiting for a go-ahead"
                .into(),
            suggested_action: "Re-dispatch with auto-approval enabled so the agent \
                               does not wait for confirmation"
                .into(),
        });
    }

    let mentions_approval = tail.iter().any(|p| {
        p.content
            .as_deref()
            .map(|c| {
                let lower = c.to_lowercase();
                APPROVAL_KEYWORDS.iter().any(|k| lower.contains(k))
            })
            .unwrap_or(false)
    });
    if mentions_approval && tool_count <= 2 {
        return Some(Finding {
            category: DiagnosisCategory::StuckOnApproval,
            confidence: 0.65,
            summary: "Recent output asks for permission or confirmation".into(),
            suggested_action: "Re-dispatch with auto-approval enabled so the agent \
                               does not wait for confirmation"
                .into(),
        });
    }
    None
}

fn infinite_retry(parts: &[FlatPart], patterns: &[ToolPattern]) -> Option<Finding> {
    let failing: Vec<&ToolPattern> = patterns
        .iter()
        .filter(|p| p.count >= 3 && p.error_ratio() >= 0.5)
        .collect();
    if failing.is_empty() {
        return None;
    }

    // Consecutive trailing errored tool parts; non-tool parts in between do
    // not break the streak.
    let error_streak = parts
        .iter()
        .rev()
        .filter(|p| p.is_tool())
        .take_while(|p| p.is_error())
        .count();

    if error_streak >= 3 {
        if let Some(last_failed) = parts.iter().rev().find(|p| p.is_tool() && p.is_error()) {
            let tool = last_failed.tool.as_deref().unwrap_or("unknown");
            let last_error = last_failed.error.as_deref().unwrap_or("unknown error");
            return Some(Finding {
                category: DiagnosisCategory::InfiniteRetry,
                confidence: 0.85,
                summary: format!(
                    "Tool {tool} failed {error_streak} times in a row; last error: {last_error}"
                ),
                suggested_action: format!(
                    "Re-dispatch with instructions to avoid {tool} or fix its preconditions first"
                ),
            });
        }
    }

    let worst = failing
        .iter()
        .copied()
        .max_by(|a, b| {
            a.error_ratio()
                .partial_cmp(&b.error_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
    Some(Finding {
        category: DiagnosisCategory::InfiniteRetry,
        confidence: 0.60,
        summary: format!(
            "Tool {} errors on {} of {} calls",
            worst.tool, worst.error_count, worst.count
        ),
        suggested_action: format!(
            "Re-dispatch with instructions to avoid {} or fix its preconditions first",
            worst.tool
        ),
    })
}

const READ_TOOLS: &[&str] = &["read", "readFile", "Read", "cat", "grep", "Grep"];

fn context_exhaustion(kill: &KillConfirmation, patterns: &[ToolPattern]) -> Option<Finding> {
    if kill.trigger.classification == LoopClassification::CachePlateau {
        return Some(Finding {
            category: DiagnosisCategory::ContextExhaustion,
            confidence: 0.90,
            summary: "Content plateaued: the session kept reprocessing the same \
                      material without making progress"
                .into(),
            suggested_action: "Re-dispatch with a narrowed scope and a summary of \
                               what has already been read"
                .into(),
        });
    }

    let read_calls: u64 = patterns
        .iter()
        .filter(|p| READ_TOOLS.contains(&p.tool.as_str()))
        .map(|p| p.count)
        .sum();
    let total_calls: u64 = patterns.iter().map(|p| p.count).sum();
    if read_calls >= 10 && total_calls > 0 && read_calls as f64 / total_calls as f64 > 0.7 {
        return Some(Finding {
            category: DiagnosisCategory::ContextExhaustion,
            confidence: 0.70,
            summary: format!(
                "{read_calls} of {total_calls} tool calls were reads; the session \
                 was consuming context without producing changes"
            ),
            suggested_action: "Re-dispatch with a narrowed scope and a summary of \
                               what has already been read"
                .into(),
        });
    }
    None
}

const EDIT_TOOLS: &[&str] = &["edit", "editFile", "Edit", "write", "Write", "writeFile"];

fn scope_creep(patterns: &[ToolPattern]) -> Option<Finding> {
    let edit_calls: u64 = patterns
        .iter()
        .filter(|p| EDIT_TOOLS.contains(&p.tool.as_str()))
        .map(|p| p.count)
        .sum();

    let confidence = match edit_calls {
        n if n > 15 => 0.75,
        n if n > 8 => 0.50,
        _ => return None,
    };
    Some(Finding {
        category: DiagnosisCategory::ScopeCreep,
        confidence,
        summary: format!("{edit_calls} edit/write calls suggest the task grew beyond its brief"),
        suggested_action: "Re-dispatch with an explicit file allowlist and a tighter \
                           definition of done"
            .into(),
    })
}

fn model_confusion(parts: &[FlatPart], patterns: &[ToolPattern]) -> Option<Finding> {
    let tools: Vec<&str> = parts
        .iter()
        .filter(|p| p.is_tool())
        .filter_map(|p| p.tool.as_deref())
        .collect();

    // edit -> undo/revert -> edit, scanned with a 3-wide sliding window.
    let flip_flops = tools
        .windows(3)
        .filter(|w| {
            matches!(w[0], "edit" | "Edit")
                && matches!(w[1], "undo" | "revert")
                && matches!(w[2], "edit" | "Edit")
        })
        .count();
    if flip_flops >= 2 {
        return Some(Finding {
            category: DiagnosisCategory::ModelConfusion,
            confidence: 0.80,
            summary: format!("{flip_flops} edit/revert flip-flop cycles detected"),
            suggested_action: "Re-dispatch with a simplified prompt and a different model".into(),
        });
    }

    let tools_with_errors = patterns.iter().filter(|p| p.error_count > 0).count();
    if tools_with_errors >= 4 {
        return Some(Finding {
            category: DiagnosisCategory::ModelConfusion,
            confidence: 0.60,
            summary: format!("{tools_with_errors} distinct tools produced errors"),
            suggested_action: "Re-dispatch with a simplified prompt and a different model".into(),
        });
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorMetrics, LoopDetection};

    fn kill_with(classification: LoopClassification) -> KillConfirmation {
        KillConfirmation {
            session_id: "s1".into(),
            killed_at: Utc::now(),
            trigger: LoopDetection {
                session_id: "s1".into(),
                classification,
                reason: "test".into(),
                metrics: DetectorMetrics::default(),
                detected_at: Utc::now(),
            },
            final_metrics: DetectorMetrics::default(),
        }
    }

    fn kill() -> KillConfirmation {
        kill_with(LoopClassification::StepOverflow)
    }

    fn tool_part(tool: &str, status: &str) -> FlatPart {
        FlatPart {
            part_type: "tool".into(),
            tool: Some(tool.into()),
            status: Some(status.into()),
            error: (status == "error").then(|| format!("{tool} blew up")),
            ..Default::default()
        }
    }

    fn text_part(content: &str) -> FlatPart {
        FlatPart {
            part_type: "text".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    // ── Tool patterns ─────────────────────────────────────────────────────────

    #[test]
    fn patterns_aggregate_per_tool() {
        let parts = vec![
            tool_part("bash", "completed"),
            tool_part("bash", "error"),
            tool_part("read", "completed"),
        ];
        let patterns = tool_patterns(&parts);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].tool, "bash");
        assert_eq!(patterns[0].count, 2);
        assert_eq!(patterns[0].error_count, 1);
        assert_eq!(patterns[0].last_status.as_deref(), Some("error"));
    }

    // ── stuck_on_approval ─────────────────────────────────────────────────────

    #[test]
    fn all_text_tail_is_stuck_on_approval() {
        let parts: Vec<FlatPart> = (0..8).map(|i| text_part(&format!("t{i}"))).collect();
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::StuckOnApproval);
        assert_eq!(report.confidence, 0.75);
    }

    #[test]
    fn approval_keywords_with_few_tools_is_stuck() {
        let mut parts = vec![
            tool_part("read", "completed"),
            text_part("I need permission to continue"),
        ];
        parts.extend((0..3).map(|i| text_part(&format!("waiting {i}"))));
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::StuckOnApproval);
        assert_eq!(report.confidence, 0.65);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let parts = vec![text_part("Please APPROVE this plan"), text_part("ok")];
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::StuckOnApproval);
    }

    // ── infinite_retry ────────────────────────────────────────────────────────

    #[test]
    fn trailing_error_streak_is_high_confidence_retry() {
        // Scenario: 6 parts, last 5 are bash errors.
        let mut parts = vec![text_part("starting")];
        parts.extend((0..5).map(|_| tool_part("bash", "error")));
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::InfiniteRetry);
        assert!(report.confidence >= 0.80);
        assert!(report.summary.contains("bash"));
    }

    #[test]
    fn text_between_errors_does_not_break_the_streak() {
        let parts = vec![
            tool_part("bash", "error"),
            text_part("retrying"),
            tool_part("bash", "error"),
            text_part("retrying again"),
            tool_part("bash", "error"),
        ];
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::InfiniteRetry);
        assert_eq!(report.confidence, 0.85);
    }

    #[test]
    fn failing_tool_without_streak_is_medium_confidence() {
        let parts = vec![
            tool_part("bash", "error"),
            tool_part("bash", "error"),
            tool_part("bash", "completed"),
            tool_part("bash", "error"),
            tool_part("read", "completed"),
        ];
        // bash: 4 calls, 3 errors, but the trailing tool part is a success.
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::InfiniteRetry);
        assert_eq!(report.confidence, 0.60);
        assert!(report.summary.contains("bash"));
    }

    #[test]
    fn under_three_calls_is_not_retry() {
        let parts = vec![tool_part("bash", "error"), tool_part("bash", "error")];
        let report = diagnose_parts(&kill(), &parts);
        assert_ne!(report.category, DiagnosisCategory::InfiniteRetry);
    }

    // ── context_exhaustion ────────────────────────────────────────────────────

    #[test]
    fn cache_plateau_kill_is_context_exhaustion() {
        let report = diagnose_parts(&kill_with(LoopClassification::CachePlateau), &[]);
        assert_eq!(report.category, DiagnosisCategory::ContextExhaustion);
        assert_eq!(report.confidence, 0.90);
    }

    #[test]
    fn read_heavy_history_is_context_exhaustion() {
        let mut parts: Vec<FlatPart> = (0..11).map(|_| tool_part("read", "completed")).collect();
        parts.push(tool_part("bash", "completed"));
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::ContextExhaustion);
        assert_eq!(report.confidence, 0.70);
    }

    #[test]
    fn few_reads_are_not_exhaustion() {
        let parts: Vec<FlatPart> = (0..5).map(|_| tool_part("read", "completed")).collect();
        let report = diagnose_parts(&kill(), &parts);
        assert_ne!(report.category, DiagnosisCategory::ContextExhaustion);
    }

    // ── scope_creep ───────────────────────────────────────────────────────────

    #[test]
    fn sixteen_edits_is_high_confidence_creep() {
        let parts: Vec<FlatPart> = (0..16).map(|_| tool_part("edit", "completed")).collect();
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::ScopeCreep);
        assert_eq!(report.confidence, 0.75);
    }

    #[test]
    fn nine_edits_is_low_confidence_creep() {
        let parts: Vec<FlatPart> = (0..9).map(|_| tool_part("write", "completed")).collect();
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::ScopeCreep);
        assert_eq!(report.confidence, 0.50);
    }

    // ── model_confusion ───────────────────────────────────────────────────────

    #[test]
    fn flip_flop_cycles_are_model_confusion() {
        let parts = vec![
            tool_part("edit", "completed"),
            tool_part("undo", "completed"),
            tool_part("edit", "completed"),
            tool_part("revert", "completed"),
            tool_part("edit", "completed"),
        ];
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::ModelConfusion);
        assert_eq!(report.confidence, 0.80);
    }

    #[test]
    fn widespread_errors_are_model_confusion() {
        let parts = vec![
            tool_part("a", "error"),
            tool_part("b", "error"),
            tool_part("c", "error"),
            tool_part("d", "error"),
        ];
        // No tool reaches 3 calls, so infinite_retry stays silent.
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::ModelConfusion);
        assert_eq!(report.confidence, 0.60);
    }

    // ── Selection & fallback ──────────────────────────────────────────────────

    #[test]
    fn empty_history_falls_back_to_model_confusion() {
        let report = diagnose_parts(&kill(), &[]);
        assert_eq!(report.category, DiagnosisCategory::ModelConfusion);
        assert_eq!(report.confidence, 0.30);
        assert!(report.summary.contains("Unable to classify"));
    }

    #[test]
    fn highest_confidence_wins_across_classifiers() {
        // Read-heavy history (0.70 exhaustion) AND a trailing bash error
        // streak (0.85 retry): retry must win.
        let mut parts: Vec<FlatPart> = (0..12).map(|_| tool_part("read", "completed")).collect();
        parts.extend((0..3).map(|_| tool_part("bash", "error")));
        let report = diagnose_parts(&kill(), &parts);
        assert_eq!(report.category, DiagnosisCategory::InfiniteRetry);
        assert_eq!(report.confidence, 0.85);
    }

    #[test]
    fn report_carries_full_tool_pattern_list() {
        let parts = vec![
            tool_part("read", "completed"),
            tool_part("edit", "completed"),
            tool_part("bash", "error"),
        ];
        let report = diagnose_parts(&kill(), &parts);
        let tools: Vec<&str> = report.tool_patterns.iter().map(|p| p.tool.as_str()).collect();
        assert_eq!(tools, vec!["read", "edit", "bash"]);
    }

    #[tokio::test]
    async fn engine_degrades_to_fallback_on_fetch_failure() {
        use foreman_host::MockHost;
        let host = Arc::new(MockHost::new());
        host.fail_messages_for("s1");
        let engine = DiagnosisEngine::new(host);
        let report = engine.diagnose(&kill()).await;
        assert_eq!(report.category, DiagnosisCategory::ModelConfusion);
        assert_eq!(report.confidence, 0.30);
    }
}
