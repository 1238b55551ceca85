// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The governor as a whole: a detection flows through kill, diagnosis and
//! fitter dispatch against the mock host, the in-memory store and the
//! recording dispatcher.

use std::sync::Arc;

use foreman_core::{Punch, PunchType};
use foreman_governor::{
    DetectorThresholds, DiagnosisCategory, DiagnosisEngine, FitterDispatch, FitterSettings,
    LoopClassification, LoopDetector, RecordingDispatcher, SessionKiller,
};
use foreman_host::{FlatPart, MockHost};
use foreman_store::MemoryStore;

fn step_punch(session: &str, i: usize) -> Punch {
    Punch::bare(
        session,
        PunchType::StepComplete,
        "step_finished",
        format!("{session}-step-{i}"),
    )
}

fn errored_tool_part(tool: &str) -> FlatPart {
    FlatPart {
        part_type: "tool".into(),
        tool: Some(tool.into()),
        status: Some("error".into()),
        error: Some("command not found".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn overflow_to_fitter_end_to_end() {
    // Twelve finished steps against a limit of ten.
    let mut detector = LoopDetector::new(
        "s1",
        DetectorThresholds {
            max_steps: 10,
            ..Default::default()
        },
    );
    for i in 0..12 {
        detector.ingest(&step_punch("s1", i));
    }
    let detection = detector.detect().expect("twelve steps must overflow");
    assert_eq!(detection.classification, LoopClassification::StepOverflow);

    // Kill it, recording the decision.
    let host = Arc::new(MockHost::new());
    let store = MemoryStore::connected();
    let kill = SessionKiller::new(host.clone())
        .kill(&detection, Some(&store))
        .await
        .unwrap();
    assert_eq!(host.aborted_sessions(), vec!["s1"]);
    assert_eq!(store.punches().len(), 1);

    // Six parts, the last five errored bash calls: infinite_retry, high
    // confidence, naming the tool.
    let mut parts = vec![FlatPart {
        part_type: "text".into(),
        content: Some("let me try that again".into()),
        ..Default::default()
    }];
    parts.extend((0..5).map(|_| errored_tool_part("bash")));
    host.set_messages("s1", parts);

    let diagnosis = DiagnosisEngine::new(host.clone()).diagnose(&kill).await;
    assert_eq!(diagnosis.category, DiagnosisCategory::InfiniteRetry);
    assert!(diagnosis.confidence >= 0.80);
    assert!(diagnosis.summary.contains("bash"));

    // Dispatch the fitter and check the resolved request.
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let fitter = FitterDispatch::new(dispatcher.clone(), FitterSettings::default());
    let result = fitter.dispatch(&diagnosis, Some(&kill)).await;
    assert!(result.success);

    let request = dispatcher.requests().remove(0);
    assert!(request.prompt.contains("s1"));
    assert!(request.prompt.contains("bash"));
    assert!(request.auto_approve);
    assert!(request.model.is_none(), "retry diagnosis keeps the model");
    assert!(request.timeout_ms >= 30_000 && request.timeout_ms <= 300_000);
}

#[tokio::test]
async fn killing_twice_keeps_one_kill_punch() {
    let mut detector = LoopDetector::new(
        "s2",
        DetectorThresholds {
            max_steps: 1,
            ..Default::default()
        },
    );
    for i in 0..3 {
        detector.ingest(&step_punch("s2", i));
    }
    let detection = detector.detect().unwrap();

    let host = Arc::new(MockHost::new());
    let store = MemoryStore::connected();
    let killer = SessionKiller::new(host.clone());

    let first = killer.kill(&detection, Some(&store)).await.unwrap();
    // Second kill: the host now reports the session gone.
    host.mark_gone("s2");
    let second = killer.kill(&detection, Some(&store)).await.unwrap();

    assert!(!first.trigger.reason.contains("already terminated"));
    assert!(second.trigger.reason.contains("already terminated"));
    assert_eq!(
        store
            .punches()
            .iter()
            .filter(|p| p.punch_type == PunchType::GovernorKill)
            .count(),
        1,
        "same decision, same punch"
    );
}

#[tokio::test]
async fn cache_plateau_kill_diagnoses_context_exhaustion() {
    let mut detector = LoopDetector::new(
        "s3",
        DetectorThresholds {
            cache_window_size: 5,
            cache_plateau_ratio: 0.5,
            ..Default::default()
        },
    );
    for i in 0..5 {
        let mut p = Punch::bare("s3", PunchType::Message, "text_response", format!("h{i}"));
        p.content_hash = Some("same-content".into());
        detector.ingest(&p);
    }
    let detection = detector.detect().unwrap();
    assert_eq!(detection.classification, LoopClassification::CachePlateau);

    let host = Arc::new(MockHost::new());
    let kill = SessionKiller::new(host.clone())
        .kill(&detection, None)
        .await
        .unwrap();

    // Even with an empty history the trigger alone decides.
    let diagnosis = DiagnosisEngine::new(host).diagnose(&kill).await;
    assert_eq!(diagnosis.category, DiagnosisCategory::ContextExhaustion);
    assert_eq!(diagnosis.confidence, 0.90);

    // And only a confusion diagnosis would have switched models.
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let fitter = FitterDispatch::new(dispatcher.clone(), FitterSettings::default());
    fitter.dispatch(&diagnosis, Some(&kill)).await;
    assert!(dispatcher.requests().remove(0).model.is_none());
}
