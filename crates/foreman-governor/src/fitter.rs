// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bounded recovery dispatch.
//!
//! After a kill and a diagnosis, a *fitter* session is launched to salvage
//! the task: a fresh session with a category-specific prompt, a hard token
//! budget, and a timeout derived from how much the failed session had
//! already spent. Transport is behind the [`SessionDispatcher`] trait so the
//! workflow layer (and tests) inject their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::diagnosis::{DiagnosisCategory, DiagnosisReport, ToolPattern};
use crate::killer::KillConfirmation;

/// Request to launch one bounded session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub prompt: String,
    pub max_token_budget: u64,
    pub timeout_ms: u64,
    pub agent_mode: String,
    pub model: Option<String>,
    pub auto_approve: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub success: bool,
    pub cost: f64,
    pub files_changed: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Transport seam for launching sessions.
#[async_trait]
pub trait SessionDispatcher: Send + Sync {
    async fn create_session(&self, request: SessionRequest) -> anyhow::Result<SessionResponse>;
}

/// Outcome of a fitter dispatch. Dispatcher failures land here as
/// `success = false` rather than propagating; the workflow layer decides
/// whether to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitterResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub cost: f64,
    pub duration_ms: u64,
    pub files_changed: Vec<String>,
    pub error: Option<String>,
}

/// Dispatch parameters, resolved from config by the daemon.
#[derive(Debug, Clone)]
pub struct FitterSettings {
    /// Explicit agent-mode override; the default mode is `code`.
    pub agent_mode: Option<String>,
    /// Model used when the diagnosis calls for switching models.
    pub recovery_model: String,
    /// Explicit token budget override; defaults to 100 000.
    pub token_budget: Option<u64>,
    pub ms_per_dollar: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Agent host the fitter session is created on.
    pub host_addr: String,
    pub host_port: u16,
}

impl Default for FitterSettings {
    fn default() -> Self {
        Self {
            agent_mode: None,
            recovery_model: "recovery-small".into(),
            token_budget: None,
            ms_per_dollar: 60_000.0,
            min_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            host_addr: "127.0.0.1".into(),
            host_port: 4096,
        }
    }
}

const DEFAULT_AGENT_MODE: &str = "code";
const DEFAULT_TOKEN_BUDGET: u64 = 100_000;

pub struct FitterDispatch {
    dispatcher: Arc<dyn SessionDispatcher>,
    settings: FitterSettings,
}

impl FitterDispatch {
    pub fn new(dispatcher: Arc<dyn SessionDispatcher>, settings: FitterSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Build and launch the recovery session for a diagnosis.
    pub async fn dispatch(
        &self,
        diagnosis: &DiagnosisReport,
        kill: Option<&KillConfirmation>,
    ) -> FitterResult {
        let request = self.build_request(diagnosis, kill);
        info!(
            session_id = %diagnosis.session_id,
            category = %diagnosis.category,
            timeout_ms = request.timeout_ms,
            "dispatching fitter session"
        );

        match self.dispatcher.create_session(request).await {
            Ok(response) => FitterResult {
                success: response.success,
                session_id: Some(response.session_id),
                cost: response.cost,
                duration_ms: response.duration_ms,
                files_changed: response.files_changed,
                error: response.error,
            },
            Err(e) => {
                warn!(session_id = %diagnosis.session_id, error = %e, "fitter dispatch failed");
                FitterResult {
                    success: false,
                    session_id: None,
                    cost: 0.0,
                    duration_ms: 0,
                    files_changed: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn build_request(
        &self,
        diagnosis: &DiagnosisReport,
        kill: Option<&KillConfirmation>,
    ) -> SessionRequest {
        let s = &self.settings;
        SessionRequest {
            prompt: build_prompt(diagnosis),
            max_token_budget: s.token_budget.unwrap_or(DEFAULT_TOKEN_BUDGET),
            timeout_ms: self.resolve_timeout(diagnosis, kill),
            agent_mode: s
                .agent_mode
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT_MODE.into()),
            // Only a confusion diagnosis justifies paying for a model switch.
            model: (diagnosis.category == DiagnosisCategory::ModelConfusion)
                .then(|| s.recovery_model.clone()),
            // Fitters operate on a narrowed scope with governor supervision,
            // so approval prompts would only stall them.
            auto_approve: true,
            host: s.host_addr.clone(),
            port: s.host_port,
        }
    }

    /// Timeout scales with what the failed session had already spent: a
    /// session killed after $2 of work earns a longer recovery window than
    /// one killed after ten cents.
    fn resolve_timeout(&self, diagnosis: &DiagnosisReport, kill: Option<&KillConfirmation>) -> u64 {
        let s = &self.settings;
        let cost_basis = match kill {
            Some(k) => 0.5 * k.final_metrics.total_cost,
            None => {
                let calls: u64 = diagnosis.tool_patterns.iter().map(|p| p.count).sum();
                (calls as f64 * 0.001).max(0.1)
            }
        };
        let raw = cost_basis * s.ms_per_dollar;
        (raw as u64).clamp(s.min_timeout_ms, s.max_timeout_ms)
    }
}

/// Category-specific recovery prompt. Every template names the session, the
/// problem, the tool activity, and the suggested way out; nothing else
/// about the control plane leaks into the prompt.
pub fn build_prompt(diagnosis: &DiagnosisReport) -> String {
    let session_id = &diagnosis.session_id;
    let summary = &diagnosis.summary;
    let action = &diagnosis.suggested_action;
    let activity = format_tool_activity(&diagnosis.tool_patterns);

    match diagnosis.category {
        DiagnosisCategory::StuckOnApproval => format!(
            "A previous work session ({session_id}) stalled waiting for approval and was \
             stopped.\n\nProblem: {summary}\n\nTool activity before the stop:\n{activity}\n\
             You have standing approval for all tool use in this session. Pick up the task, \
             act decisively, and do not ask for permission.\n\nRecommended approach: {action}"
        ),
        DiagnosisCategory::InfiniteRetry => format!(
            "A previous work session ({session_id}) was stopped while retrying a failing \
             operation.\n\nProblem: {summary}\n\nTool activity before the stop:\n{activity}\n\
             Do not repeat the failing call. Diagnose why it fails first, then either fix \
             the precondition or find another route.\n\nRecommended approach: {action}"
        ),
        DiagnosisCategory::ScopeCreep => format!(
            "A previous work session ({session_id}) was stopped after drifting far beyond \
             its original task.\n\nProblem: {summary}\n\nTool activity before the stop:\n\
             {activity}\nFinish only the minimal remaining work. Touch as few files as \
             possible and stop when the original goal is met.\n\nRecommended approach: {action}"
        ),
        DiagnosisCategory::ContextExhaustion => format!(
            "A previous work session ({session_id}) was stopped after exhausting its context \
             re-reading material.\n\nProblem: {summary}\n\nTool activity before the stop:\n\
             {activity}\nWork from the summary above instead of re-reading. Target only the \
             files needed to finish.\n\nRecommended approach: {action}"
        ),
        DiagnosisCategory::ModelConfusion => format!(
            "A previous work session ({session_id}) was stopped after producing contradictory \
             actions.\n\nProblem: {summary}\n\nTool activity before the stop:\n{activity}\n\
             Take the simplest path: plan once, then execute linearly without revisiting \
             earlier decisions.\n\nRecommended approach: {action}"
        ),
    }
}

/// Top 10 tools by call count, busiest first, with error counts.
fn format_tool_activity(patterns: &[ToolPattern]) -> String {
    if patterns.is_empty() {
        return "  (no tool activity recorded)".into();
    }
    let mut sorted: Vec<&ToolPattern> = patterns.iter().collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tool.cmp(&b.tool)));
    sorted
        .iter()
        .take(10)
        .map(|p| format!("  - {}: {} calls ({} errors)", p.tool, p.count, p.error_count))
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
