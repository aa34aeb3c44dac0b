//! End-to-end runs of the orchestrator against a scripted LLM and an
//! in-process sandbox.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

use aria_forge::pipeline::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, PipelineOrchestrator, RunEvent, RunOutcome, RunStatus,
    SourceDescriptor, SourceKind, Stage,
};
use aria_forge::report::RenderedArtifact;
use aria_forge::tools::{KnowledgeBase, KnowledgeBaseError};
use aria_forge::{HumanCorrection, PipelineError, RunRequest};

use common::*;

fn csv_request(dir: &TempDir) -> RunRequest {
    let location = write_sales_csv(dir.path());
    RunRequest::new(vec![SourceDescriptor::new("sales", SourceKind::File, location)])
}

fn visits(outcome: &RunOutcome, stage: Stage) -> usize {
    outcome
        .state()
        .stage_history
        .iter()
        .filter(|visit| visit.stage == stage)
        .count()
}

fn assert_iteration_never_decreases(outcome: &RunOutcome) {
    for pair in outcome.state().stage_history.windows(2) {
        assert!(
            pair[1].iteration >= pair[0].iteration,
            "iteration went from {} ({}) to {} ({})",
            pair[0].iteration,
            pair[0].stage,
            pair[1].iteration,
            pair[1].stage
        );
    }
}

/// Knowledge base answering every query with the same snippet.
struct EchoingKnowledgeBase;

#[async_trait]
impl KnowledgeBase for EchoingKnowledgeBase {
    async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<String>, KnowledgeBaseError> {
        Ok(vec!["shared benchmark".to_string()])
    }
}

#[tokio::test]
async fn test_clear_domain_renders_every_format() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.9, 0.85));
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    assert!(!outcome.is_suspended());
    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert!(state.errors.is_empty(), "unexpected errors: {:?}", state.errors);
    assert!(!state.degraded_report);
    assert_eq!(state.domain, "retail sales");
    assert_eq!(state.iteration, 1);
    assert_eq!(state.artifacts.len(), 5);
    for artifact in state.artifacts.values() {
        if let RenderedArtifact::File(path) = artifact {
            assert!(path.exists(), "missing {}", path.display());
        }
    }
    assert_eq!(llm.calls(DOMAIN), 1);
    assert_eq!(llm.calls(TRIZ), 1);

    let stages: Vec<Stage> = state.stage_history.iter().map(|v| v.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::DomainIdentifier,
            Stage::DataExtractor,
            Stage::DataOperator,
            Stage::RagRetriever,
            Stage::DataConsolidator,
            Stage::TrizAnalyzer,
            Stage::ReportGenerator,
        ]
    );
    assert!(state
        .decisions
        .iter()
        .any(|d| d.stage == Stage::DomainIdentifier && d.outcome == "proceed"));

    let stats = orchestrator.stats();
    assert_eq!(stats.runs_started, 1);
    assert_eq!(stats.runs_completed, 1);
}

#[tokio::test]
async fn test_ambiguous_domain_suspends_and_resumes() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.2, 0.85));
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator
        .start_run(csv_request(&dir).with_thread_id("t-ambiguous"))
        .await
        .unwrap();

    let RunOutcome::Suspended { state, prompt } = outcome else {
        panic!("run should suspend at the human checkpoint");
    };
    assert_eq!(state.status, RunStatus::WaitingForHuman);
    assert_eq!(state.current_stage, Some(Stage::HumanCheckpoint));
    assert_eq!(prompt.thread_id, "t-ambiguous");
    assert!(state.artifacts.is_empty());
    assert!(orchestrator.checkpoints().load("t-ambiguous").await.unwrap().is_some());

    let resumed = orchestrator
        .resume_run(
            "t-ambiguous",
            HumanCorrection::confirm().with_domain("regional retail").with_kpis(["revenue"]),
        )
        .await
        .unwrap();

    let state = resumed.state();
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.domain, "regional retail");
    assert_eq!(state.reporting_period, "Q3 2024");
    assert_eq!(state.kpis, vec!["revenue".to_string()]);
    assert_eq!(state.domain_confidence, 1.0);
    assert_eq!(visits(&resumed, Stage::HumanCheckpoint), 1);
    assert_eq!(visits(&resumed, Stage::DomainIdentifier), 1);
    assert_eq!(llm.calls(DOMAIN), 1);
    assert_eq!(state.artifacts.len(), 5);

    let err = orchestrator
        .resume_run("t-ambiguous", HumanCorrection::confirm())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CheckpointNotFound(id) if id == "t-ambiguous"));
}

#[tokio::test]
async fn test_research_branch_passes_through_to_extraction() {
    let dir = TempDir::new().unwrap();
    let mut answer = domain_answer(0.9);
    answer["needs_research_agent"] = json!(true);
    let llm = Arc::new(
        ScriptedLlm::new()
            .on_json(DOMAIN, answer)
            .on_json(PLAN, plan_answer())
            .on_json(TRIZ, triz_answer(0.85)),
    );
    let orchestrator = orchestrator(dir.path(), llm, Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let stages: Vec<Stage> = outcome.state().stage_history.iter().map(|v| v.stage).collect();
    assert_eq!(&stages[..3], &[Stage::DomainIdentifier, Stage::ResearchAgent, Stage::DataExtractor]);
    assert_eq!(outcome.state().status, RunStatus::Done);
}

#[tokio::test]
async fn test_resume_requires_a_suspended_run() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(happy_llm(0.9, 0.85)), Arc::new(FakeSandbox::default()));

    let err = orchestrator
        .resume_run("never-started", HumanCorrection::confirm())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CheckpointNotFound(_)));
}

#[tokio::test]
async fn test_corrupt_checkpoint_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryCheckpointStore::new());
    store.insert_raw("t-corrupt", "{ not json");
    let orchestrator = PipelineOrchestrator::builder(test_config(dir.path()))
        .provider(Arc::new(happy_llm(0.9, 0.85)))
        .sandbox(Arc::new(FakeSandbox::default()))
        .checkpoints(store)
        .build()
        .unwrap();

    let outcome = orchestrator
        .resume_run("t-corrupt", HumanCorrection::confirm())
        .await
        .unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.errors.iter().any(|e| e.starts_with("resume:")));
    assert!(state.artifacts.is_empty());
}

#[tokio::test]
async fn test_missing_file_retries_then_degrades() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.9, 0.85));
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));
    let missing = dir.path().join("missing.csv").display().to_string();

    let outcome = orchestrator
        .start_run(RunRequest::new(vec![SourceDescriptor::new("gone", SourceKind::File, missing)]))
        .await
        .unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert!(state.degraded_report);
    assert_eq!(state.iteration, 3);
    assert_eq!(visits(&outcome, Stage::DataExtractor), 3);
    assert_eq!(visits(&outcome, Stage::ErrorHandler), 3);
    assert_eq!(visits(&outcome, Stage::TrizAnalyzer), 0);
    assert_iteration_never_decreases(&outcome);
    assert_eq!(
        state.errors.iter().filter(|e| e.starts_with("data_extractor [gone]")).count(),
        3
    );

    let error_decisions: Vec<&str> = state
        .decisions
        .iter()
        .filter(|d| d.stage == Stage::ErrorHandler && d.condition.contains("errors="))
        .map(|d| d.rationale.as_str())
        .collect();
    assert_eq!(
        error_decisions,
        vec![
            "Retrying extraction",
            "Retrying extraction",
            "Max retries reached; generating degraded report"
        ]
    );

    // the report still renders, flagged as degraded
    assert_eq!(state.artifacts.len(), 5);
    match &state.artifacts["markdown"] {
        RenderedArtifact::Inline(markdown) => assert!(markdown.contains("DEGRADED REPORT")),
        other => panic!("markdown should render inline, got {:?}", other),
    }
    assert_eq!(orchestrator.stats().degraded_reports, 1);
}

#[tokio::test]
async fn test_unsupported_format_synthesizes_extractor_once() {
    let dir = TempDir::new().unwrap();
    let xml = dir.path().join("sales.xml");
    std::fs::write(&xml, "<sales><row region=\"north\" revenue=\"120\"/></sales>").unwrap();
    let request = || {
        RunRequest::new(vec![SourceDescriptor::new(
            "feed",
            SourceKind::File,
            xml.display().to_string(),
        )])
    };

    let llm = Arc::new(happy_llm(0.9, 0.85).on_json(GENERATE, generated_code("extract_xml")));
    let sandbox = Arc::new(FakeSandbox::default());
    let orchestrator = orchestrator(dir.path(), llm.clone(), sandbox.clone());

    let first = orchestrator.start_run(request()).await.unwrap();

    let state = first.state();
    assert_eq!(state.status, RunStatus::Done);
    assert!(state.errors.is_empty(), "unexpected errors: {:?}", state.errors);
    let result = state.synthesis_result.as_ref().expect("synthesis ran");
    assert!(result.is_success());
    assert!(result.validated);
    assert_eq!(result.repair_attempts, 0);
    assert_eq!(visits(&first, Stage::ToolBuilderAgent), 1);
    assert!(orchestrator.registry().contains("extract_xml"));
    assert!(dir.path().join("capabilities").join("extract_xml.py").exists());
    assert_eq!(llm.calls(GENERATE), 1);

    let second = orchestrator.start_run(request()).await.unwrap();

    let state = second.state();
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(visits(&second, Stage::ToolBuilderAgent), 0);
    assert_eq!(state.extracted_records.len(), 1);
    assert_eq!(state.extracted_records[0].payload, xml_rows());
    assert_eq!(llm.calls(GENERATE), 1);
}

#[tokio::test]
async fn test_synthesized_extractor_survives_restart() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.9, 0.85).on_json(GENERATE, generated_code("extract_xml")));
    let sandbox = Arc::new(FakeSandbox::default());
    let xml = dir.path().join("sales.xml");
    std::fs::write(&xml, "<sales/>").unwrap();
    let request = RunRequest::new(vec![SourceDescriptor::new(
        "feed",
        SourceKind::File,
        xml.display().to_string(),
    )]);

    orchestrator(dir.path(), llm.clone(), sandbox.clone())
        .start_run(request.clone())
        .await
        .unwrap();

    let restarted = orchestrator(dir.path(), llm.clone(), sandbox);
    assert!(!restarted.registry().contains("extract_xml"));
    let report = restarted.reload_capabilities().unwrap();
    assert_eq!(report.loaded, vec!["extract_xml".to_string()]);

    let outcome = restarted.start_run(request).await.unwrap();
    assert_eq!(outcome.state().extracted_records[0].payload, xml_rows());
    assert_eq!(llm.calls(GENERATE), 1);
}

#[tokio::test]
async fn test_failed_synthesis_continues_to_retrieval() {
    let dir = TempDir::new().unwrap();
    let plan = json!({
        "reasoning": "need a rolling average",
        "operations": [],
        "missing_capability": {
            "name": "rolling_average",
            "description": "7-day rolling average of numeric fields",
            "example": "{\"records\": [], \"params\": {\"window\": 7}}"
        }
    });
    let broken = json!({"code": "def rolling_average(payload):\n    SYNTAX_ERROR\n"});
    let llm = Arc::new(
        ScriptedLlm::new()
            .on_json(DOMAIN, domain_answer(0.9))
            .on_json(PLAN, plan)
            .on_json(TRIZ, triz_answer(0.85))
            .on_json(GENERATE, broken.clone())
            .on_json(REPAIR, broken),
    );
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    let result = state.synthesis_result.as_ref().unwrap();
    assert!(!result.is_success());
    assert_eq!(result.repair_attempts, 3);
    assert!(state
        .errors
        .iter()
        .any(|e| e.starts_with("tool_builder_agent [rolling_average]")));
    assert!(!orchestrator.registry().contains("rolling_average"));
    assert_eq!(state.attempted_capabilities, vec!["rolling_average".to_string()]);

    let stages: Vec<Stage> = state.stage_history.iter().map(|v| v.stage).collect();
    let builder = stages.iter().position(|s| *s == Stage::ToolBuilderAgent).unwrap();
    assert_eq!(stages[builder + 1], Stage::RagRetriever);
    assert_eq!(llm.calls(GENERATE), 1);
    assert_eq!(llm.calls(REPAIR), 3);
}

#[tokio::test]
async fn test_low_confidence_refines_until_cap() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.9, 0.40));
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.iteration, 3);
    assert_eq!(state.confidence_score, 0.40);
    assert!(state.degraded_report);
    assert_eq!(llm.calls(TRIZ), 3);
    assert_eq!(visits(&outcome, Stage::DataExtractor), 3);
    assert_eq!(visits(&outcome, Stage::ReportGenerator), 1);
    assert_iteration_never_decreases(&outcome);
    let last = state.stage_history.last().unwrap();
    assert_eq!(last.iteration, 3);

    let triz_outcomes: Vec<&str> = state
        .decisions
        .iter()
        .filter(|d| d.stage == Stage::TrizAnalyzer && d.condition.starts_with("confidence="))
        .map(|d| d.outcome.as_str())
        .collect();
    assert_eq!(triz_outcomes, vec!["data_extractor", "data_extractor", "report_generator"]);

    let report = state.report.as_ref().unwrap();
    assert!(report.is_degraded());
}

#[tokio::test]
async fn test_confidence_recovers_on_second_pass() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .on_json(DOMAIN, domain_answer(0.9))
            .on_json(PLAN, plan_answer())
            .on_json(TRIZ, triz_answer(0.5))
            .on_json(TRIZ, triz_answer(0.75))
            .on(SUMMARY, "summary"),
    );
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.iteration, 2);
    assert!(!state.degraded_report);
    assert_eq!(llm.calls(TRIZ), 2);
}

#[tokio::test]
async fn test_stage_visit_guard_forces_report() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.9, 0.40));
    let orchestrator = PipelineOrchestrator::builder(test_config(dir.path()).with_max_stage_visits(11))
        .provider(llm)
        .sandbox(Arc::new(FakeSandbox::default()))
        .build()
        .unwrap();

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert!(state.degraded_report);
    assert!(state.errors.iter().any(|e| e.contains("stage limit of 11")));
    assert_eq!(state.stage_history.len(), 12);
    assert_eq!(state.stage_history.last().unwrap().stage, Stage::ReportGenerator);
}

#[tokio::test]
async fn test_domain_outage_asks_a_human() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(ScriptedLlm::new()), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    assert!(outcome.is_suspended());
    let state = outcome.state();
    assert_eq!(state.domain, "unknown");
    assert_eq!(state.domain_confidence, 0.0);
    assert!(state.errors.iter().any(|e| e.starts_with("domain_identifier")));
}

#[tokio::test]
async fn test_analysis_outage_still_reports() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlm::new().on_json(DOMAIN, domain_answer(0.9)));
    let orchestrator = orchestrator(dir.path(), llm.clone(), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert!(state.degraded_report);
    assert_eq!(state.confidence_score, 0.0);
    assert!(state.errors.iter().any(|e| e.starts_with("triz_analyzer")));
    // an unusable plan falls back to normalize
    assert!(!state.processed_records.is_empty());
    assert_eq!(state.artifacts.len(), 5);
}

#[tokio::test]
async fn test_unknown_output_format_is_recorded() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(happy_llm(0.9, 0.85)), Arc::new(FakeSandbox::default()));

    let outcome = orchestrator
        .start_run(csv_request(&dir).with_formats(["markdown", "docx"]))
        .await
        .unwrap();

    let state = outcome.state();
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.artifacts.len(), 1);
    assert!(state.artifacts.contains_key("markdown"));
    assert!(state.errors.iter().any(|e| e.starts_with("report_generator [docx]")));
}

#[tokio::test]
async fn test_empty_request_is_rejected() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(happy_llm(0.9, 0.85)), Arc::new(FakeSandbox::default()));

    let err = orchestrator.start_run(RunRequest::new(Vec::new())).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_unsafe_thread_id_is_rejected_before_any_stage() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(happy_llm(0.2, 0.85));
    let orchestrator = PipelineOrchestrator::builder(test_config(dir.path()))
        .provider(llm.clone())
        .sandbox(Arc::new(FakeSandbox::default()))
        .checkpoints(Arc::new(FileCheckpointStore::new(dir.path().join("runs"))))
        .build()
        .unwrap();

    let err = orchestrator
        .start_run(csv_request(&dir).with_thread_id("team/run-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidRequest(ref msg) if msg.contains("team/run-1")));
    assert_eq!(llm.calls(DOMAIN), 0);
    assert_eq!(orchestrator.stats().runs_started, 0);

    let outcome = orchestrator
        .start_run(csv_request(&dir).with_thread_id("team-run-1"))
        .await
        .unwrap();
    assert!(outcome.is_suspended());
    assert!(orchestrator.checkpoints().load("team-run-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_retrieval_keeps_every_returned_snippet() {
    let dir = TempDir::new().unwrap();
    let orchestrator = PipelineOrchestrator::builder(test_config(dir.path()))
        .provider(Arc::new(happy_llm(0.9, 0.85)))
        .sandbox(Arc::new(FakeSandbox::default()))
        .knowledge(Arc::new(EchoingKnowledgeBase))
        .build()
        .unwrap();

    let outcome = orchestrator.start_run(csv_request(&dir)).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.rag_queries.len(), 3);
    assert_eq!(state.rag_chunks.len(), state.rag_queries.len());
    assert!(state.rag_chunks.iter().all(|c| c == "shared benchmark"));
    let retrieval = state
        .stage_history
        .iter()
        .find(|v| v.stage == Stage::RagRetriever)
        .unwrap();
    assert_eq!(retrieval.summary, "3 queries, 3 chunks");
}

#[tokio::test]
async fn test_streaming_yields_stage_updates() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(happy_llm(0.9, 0.85)), Arc::new(FakeSandbox::default()));

    let events: Vec<RunEvent> = orchestrator
        .start_run_streaming(csv_request(&dir).with_thread_id("t-stream"))
        .map(|event| event.unwrap())
        .collect()
        .await;

    let updates: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::Stage(update) => Some(update),
            RunEvent::Finished(_) => None,
        })
        .collect();
    assert_eq!(updates.len(), 7);
    assert_eq!(updates[0].stage, Stage::DomainIdentifier);
    assert!(updates[0].changes.iter().any(|field| field == "domain"));
    assert!(updates.iter().all(|update| update.thread_id == "t-stream"));
    assert_eq!(updates.last().unwrap().stage, Stage::ReportGenerator);

    match events.last() {
        Some(RunEvent::Finished(RunOutcome::Completed(state))) => assert_eq!(state.status, RunStatus::Done),
        other => panic!("unexpected final event: {:?}", other),
    }
}

#[tokio::test]
async fn test_streaming_ends_at_suspension() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(dir.path(), Arc::new(happy_llm(0.1, 0.85)), Arc::new(FakeSandbox::default()));

    let events: Vec<RunEvent> = orchestrator
        .start_run_streaming(csv_request(&dir))
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], RunEvent::Finished(outcome) if outcome.is_suspended()));
}
