// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Punch-card validation: did a task produce the punches its card demands,
//! and none of the ones it forbids?
//!
//! Validation reads only what the writer persisted; results are transient
//! and never stored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use foreman_core::{CardRequirement, PunchType};
use foreman_store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum CardError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    /// Required patterns with no matching punch.
    pub missing: Vec<String>,
    /// Forbidden patterns that matched at least one punch.
    pub violations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_adherence: Option<AdherenceResult>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdherenceResult {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub within_range: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskReport {
    pub parent_task_id: String,
    pub children: Vec<(String, ValidationResult)>,
    pub all_children_valid: bool,
}

/// Tool-call punch keys that count as file mutations for the adherence
/// check.
const MUTATING_TOOLS: &[&str] = &["write_to_file", "edit_file", "apply_diff"];

pub struct CardValidator {
    store: Arc<dyn Store>,
}

impl CardValidator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Evaluate a card against a task's punches.
    ///
    /// An empty card fails: a card with no rows validates nothing, and
    /// passing it would make a typo'd card id look like success.
    pub async fn validate(
        &self,
        task_id: &str,
        card_id: &str,
    ) -> Result<ValidationResult, CardError> {
        let requirements = self.store.card_requirements(card_id).await?;
        if requirements.is_empty() {
            debug!(card_id, "card has no requirements, failing closed");
            return Ok(ValidationResult {
                status: ValidationStatus::Fail,
                missing: Vec::new(),
                violations: Vec::new(),
                tool_adherence: None,
            });
        }

        let mut missing = Vec::new();
        let mut violations = Vec::new();

        for req in &requirements {
            // Inactive rows are kept in the table for documentation but
            // checked nowhere.
            if !req.required {
                continue;
            }
            let count = self
                .store
                .count_punches(task_id, req.punch_type, &req.punch_key_pattern)
                .await?;
            if req.forbidden {
                if count > 0 {
                    violations.push(requirement_label(req));
                }
            } else if count == 0 {
                missing.push(requirement_label(req));
            }
        }

        let status = if missing.is_empty() && violations.is_empty() {
            ValidationStatus::Pass
        } else {
            ValidationStatus::Fail
        };
        Ok(ValidationResult {
            status,
            missing,
            violations,
            tool_adherence: None,
        })
    }

    /// [`validate`](Self::validate) plus a mutation-count adherence check
    /// folded into the result. Adherence failure fails the whole result.
    pub async fn validate_with_adherence(
        &self,
        task_id: &str,
        card_id: &str,
        range: (u64, u64),
    ) -> Result<ValidationResult, CardError> {
        let mut result = self.validate(task_id, card_id).await?;
        let adherence = self.check_tool_adherence(task_id, range).await?;
        if !adherence.within_range {
            result.status = ValidationStatus::Fail;
        }
        result.tool_adherence = Some(adherence);
        Ok(result)
    }

    /// Count file-mutating tool-call punches and check the count lies in
    /// `[min, max]`.
    pub async fn check_tool_adherence(
        &self,
        task_id: &str,
        (min, max): (u64, u64),
    ) -> Result<AdherenceResult, CardError> {
        let mut count = 0;
        for tool in MUTATING_TOOLS {
            count += self
                .store
                .count_punches(task_id, PunchType::ToolCall, tool)
                .await?;
        }
        Ok(AdherenceResult {
            count,
            min,
            max,
            within_range: min <= count && count <= max,
        })
    }

    /// Validate every recorded child of a parent task against a card.
    pub async fn verify_subtasks(
        &self,
        parent_task_id: &str,
        child_card_id: &str,
    ) -> Result<SubtaskReport, CardError> {
        let child_ids = self.store.children_of(parent_task_id).await?;
        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            let result = self.validate(&child_id, child_card_id).await?;
            children.push((child_id, result));
        }
        let all_children_valid = children.iter().all(|(_, r)| r.passed());
        Ok(SubtaskReport {
            parent_task_id: parent_task_id.to_string(),
            children,
            all_children_valid,
        })
    }
}

fn requirement_label(req: &CardRequirement) -> String {
    match &req.description {
        Some(desc) => format!("{} {} ({desc})", req.punch_type, req.punch_key_pattern),
        None => format!("{} {}", req.punch_type, req.punch_key_pattern),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::Punch;
    use foreman_store::MemoryStore;

    fn requirement(card: &str, pattern: &str, required: bool, forbidden: bool) -> CardRequirement {
        CardRequirement {
            card_id: card.into(),
            punch_type: PunchType::ToolCall,
            punch_key_pattern: pattern.into(),
            required,
            forbidden,
            description: None,
        }
    }

    async fn seed_tool_punch(store: &MemoryStore, task: &str, key: &str, hash: &str) {
        store
            .write_punch(&Punch::bare(task, PunchType::ToolCall, key, hash))
            .await
            .unwrap();
    }

    fn validator(store: Arc<MemoryStore>) -> CardValidator {
        CardValidator::new(store)
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn matching_required_punch_passes() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "read_file%", true, false));
        seed_tool_punch(&store, "t1", "read_file", "h1").await;

        let result = validator(store).validate("t1", "card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Pass);
        assert!(result.missing.is_empty());
        assert!(result.violations.is_empty());
    }

    #[tokio::test]
    async fn unmet_requirement_lands_in_missing() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "read_file%", true, false));

        let result = validator(store).validate("t1", "card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Fail);
        assert_eq!(result.missing, vec!["tool_call read_file%"]);
    }

    #[tokio::test]
    async fn forbidden_match_lands_in_violations() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "bash%", true, true));
        seed_tool_punch(&store, "t1", "bash", "h1").await;

        let result = validator(store).validate("t1", "card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Fail);
        assert!(result.missing.is_empty());
        assert_eq!(result.violations, vec!["tool_call bash%"]);
    }

    #[tokio::test]
    async fn forbidden_without_match_is_fine() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "bash%", true, true));
        store.add_card_requirement(requirement("card", "read%", true, false));
        seed_tool_punch(&store, "t1", "read_file", "h1").await;

        let result = validator(store).validate("t1", "card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Pass);
    }

    #[tokio::test]
    async fn inactive_rows_are_skipped_entirely() {
        let store = Arc::new(MemoryStore::connected());
        // required=false: checked nowhere, even though nothing matches it.
        store.add_card_requirement(requirement("card", "never_matches", false, false));
        store.add_card_requirement(requirement("card", "read%", true, false));
        seed_tool_punch(&store, "t1", "read_file", "h1").await;

        let result = validator(store).validate("t1", "card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Pass);
    }

    #[tokio::test]
    async fn empty_card_fails_closed() {
        let store = Arc::new(MemoryStore::connected());
        let result = validator(store).validate("t1", "missing-card").await.unwrap();
        assert_eq!(result.status, ValidationStatus::Fail);
    }

    #[tokio::test]
    async fn removing_the_satisfying_punch_flips_pass_to_fail() {
        // Validator symmetry, run as two stores: with and without the punch.
        let with = Arc::new(MemoryStore::connected());
        with.add_card_requirement(requirement("card", "read_file%", true, false));
        seed_tool_punch(&with, "t1", "read_file", "h1").await;
        assert!(validator(with).validate("t1", "card").await.unwrap().passed());

        let without = Arc::new(MemoryStore::connected());
        without.add_card_requirement(requirement("card", "read_file%", true, false));
        let result = validator(without).validate("t1", "card").await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.missing, vec!["tool_call read_file%"]);
    }

    #[tokio::test]
    async fn adding_a_forbidden_punch_flips_pass_to_fail() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "read%", true, false));
        store.add_card_requirement(requirement("card", "rm%", true, true));
        seed_tool_punch(&store, "t1", "read_file", "h1").await;

        let v = validator(store.clone());
        assert!(v.validate("t1", "card").await.unwrap().passed());

        seed_tool_punch(&store, "t1", "rm_rf", "h2").await;
        let result = v.validate("t1", "card").await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.violations, vec!["tool_call rm%"]);
    }

    // ── Tool adherence ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn adherence_counts_only_mutating_tools() {
        let store = Arc::new(MemoryStore::connected());
        seed_tool_punch(&store, "t1", "write_to_file", "h1").await;
        seed_tool_punch(&store, "t1", "edit_file", "h2").await;
        seed_tool_punch(&store, "t1", "apply_diff", "h3").await;
        seed_tool_punch(&store, "t1", "read_file", "h4").await;

        let v = validator(store);
        let adherence = v.check_tool_adherence("t1", (1, 5)).await.unwrap();
        assert_eq!(adherence.count, 3);
        assert!(adherence.within_range);

        let tight = v.check_tool_adherence("t1", (4, 9)).await.unwrap();
        assert!(!tight.within_range);
    }

    #[tokio::test]
    async fn adherence_bounds_are_inclusive() {
        let store = Arc::new(MemoryStore::connected());
        seed_tool_punch(&store, "t1", "edit_file", "h1").await;
        seed_tool_punch(&store, "t1", "edit_file2", "h2").await; // not counted

        let adherence = validator(store)
            .check_tool_adherence("t1", (1, 1))
            .await
            .unwrap();
        assert_eq!(adherence.count, 1);
        assert!(adherence.within_range);
    }

    #[tokio::test]
    async fn out_of_range_adherence_fails_combined_result() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("card", "read%", true, false));
        seed_tool_punch(&store, "t1", "read_file", "h1").await;

        let result = validator(store)
            .validate_with_adherence("t1", "card", (1, 3))
            .await
            .unwrap();
        assert!(!result.passed(), "zero mutations is below the floor");
        assert!(result.missing.is_empty());
        let adherence = result.tool_adherence.unwrap();
        assert_eq!(adherence.count, 0);
    }

    // ── Subtask verification ──────────────────────────────────────────────────

    #[tokio::test]
    async fn verify_subtasks_aggregates_children() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("child-card", "read%", true, false));
        store.write_child_relation("parent", "kid-a").await.unwrap();
        store.write_child_relation("parent", "kid-b").await.unwrap();
        seed_tool_punch(&store, "kid-a", "read_file", "h1").await;
        // kid-b has no punches and must fail.

        let report = validator(store)
            .verify_subtasks("parent", "child-card")
            .await
            .unwrap();
        assert_eq!(report.children.len(), 2);
        assert!(!report.all_children_valid);
        let kid_a = report.children.iter().find(|(id, _)| id == "kid-a").unwrap();
        assert!(kid_a.1.passed());
    }

    #[tokio::test]
    async fn no_children_is_vacuously_valid() {
        let store = Arc::new(MemoryStore::connected());
        store.add_card_requirement(requirement("child-card", "read%", true, false));
        let report = validator(store)
            .verify_subtasks("parent", "child-card")
            .await
            .unwrap();
        assert!(report.children.is_empty());
        assert!(report.all_children_valid);
    }
}
