//! Stage implementations.
//!
//! Every stage reads the run state, calls its collaborators and writes its
//! results back. Stages never fail the run: problems are appended to
//! `state.errors` and routing decides what happens next.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::{CapabilityError, RenderError};
use crate::llm::OracleError;
use crate::prompts::{build_domain_prompt, build_operation_plan_prompt, build_triz_prompt};
use crate::registry::{Capability, CapabilityKind};
use crate::report::{assemble_report, render_charts};
use crate::synthesis::{extractor_name_for_format, probe_inputs, CapabilitySpec, SynthesisResult};
use crate::tools::rows::payload_rows;
use crate::tools::{consolidate, fallback_dataset, is_supported_file_format};
use crate::utils::truncate_chars;

use super::orchestrator::PipelineOrchestrator;
use super::preview::build_source_preview;
use super::routing::{
    is_degraded_after_triz, route_after_error, route_after_triz, HUMAN_ESCALATION_THRESHOLD,
    MAX_REFINEMENT_ITERATIONS,
};
use super::state::{
    AppliedPrinciple, Contradiction, ContradictionKind, ExtractedRecord, PipelineState, Priority, Recommendation,
    RunStatus, SourceKind, Stage, TrizAnalysis,
};

/// Prompt characters kept in conversation memory per exchange.
const PROMPT_MEMORY_CHARS: usize = 2000;

/// Rows shown to the oracle when planning operations.
const PLAN_SAMPLE_ROWS: usize = 5;

const DEFAULT_OPERATION: &str = "normalize";

impl PipelineOrchestrator {
    /// Run one stage against the state and return its visit summary.
    pub(crate) async fn execute(&self, state: &mut PipelineState, stage: Stage) -> String {
        match stage {
            Stage::DomainIdentifier => self.identify_domain(state).await,
            // Suspension is handled by the orchestrator before dispatch.
            Stage::HumanCheckpoint => "awaiting human confirmation".to_string(),
            Stage::ResearchAgent => "research passthrough".to_string(),
            Stage::DataExtractor => self.extract_sources(state).await,
            Stage::DataOperator => self.operate_on_data(state).await,
            Stage::ToolBuilderAgent => self.build_missing_tool(state).await,
            Stage::RagRetriever => self.retrieve_context(state).await,
            Stage::DataConsolidator => self.consolidate_data(state),
            Stage::TrizAnalyzer => self.analyze_triz(state).await,
            Stage::ErrorHandler => self.handle_errors(state),
            Stage::ReportGenerator => self.generate_report(state),
        }
    }

    /// Ask the oracle with compressed conversation context and remember the
    /// exchange.
    async fn consult(&self, state: &mut PipelineState, prompt: &str) -> Result<Map<String, Value>, OracleError> {
        let context = self.compressor.context_for(&mut state.conversation).await;
        let result = self.oracle.ask_json(prompt, context.as_deref()).await;
        let remembered = truncate_chars(prompt, PROMPT_MEMORY_CHARS);
        match result {
            Ok((object, raw)) => {
                state.conversation.record_exchange(remembered, raw);
                Ok(object)
            }
            Err(e) => {
                state.conversation.record_exchange(remembered, format!("[no usable answer: {}]", e));
                Err(e)
            }
        }
    }

    async fn invoke_bounded(&self, capability: &Arc<dyn Capability>, input: Value) -> Result<Value, CapabilityError> {
        let timeout = self.config.stage_timeout;
        match tokio::time::timeout(timeout, capability.invoke(input)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout(timeout)),
        }
    }

    // ------------------------------------------------------------------
    // domain_identifier
    // ------------------------------------------------------------------

    async fn identify_domain(&self, state: &mut PipelineState) -> String {
        let preview = build_source_preview(&state.sources).await;
        let prompt = build_domain_prompt(&preview, state.user_instruction.as_deref());

        let (reasoning, outcome) = match self.consult(state, &prompt).await {
            Ok(object) => {
                state.domain = text_field(&object, "domain").unwrap_or_else(|| "unknown".to_string());
                state.reporting_period =
                    text_field(&object, "reporting_period").unwrap_or_else(|| "unknown".to_string());
                state.kpis = string_list(object.get("kpis"));
                state.set_domain_confidence(number_field(&object, "domain_confidence").unwrap_or(0.0));
                state.needs_research = object
                    .get("needs_research_agent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                state.clarification_question = text_field(&object, "clarification_question");
                (text_field(&object, "reasoning").unwrap_or_default(), "ok")
            }
            Err(e) => {
                state.push_error(oracle_failure("domain_identifier", &e));
                state.domain = "unknown".to_string();
                state.reporting_period = "unknown".to_string();
                state.kpis.clear();
                state.set_domain_confidence(0.0);
                state.needs_research = false;
                (String::new(), "failed")
            }
        };

        let escalation = if state.domain_confidence >= HUMAN_ESCALATION_THRESHOLD {
            "proceed"
        } else {
            "human_checkpoint"
        };
        state.record_decision(
            Stage::DomainIdentifier,
            format!("confidence={:.2}", state.domain_confidence),
            escalation,
            reasoning,
        );

        format!(
            "domain '{}' ({}) confidence {:.2}, {} KPIs, oracle {}",
            state.domain,
            state.reporting_period,
            state.domain_confidence,
            state.kpis.len(),
            outcome
        )
    }

    // ------------------------------------------------------------------
    // data_extractor
    // ------------------------------------------------------------------

    async fn extract_sources(&self, state: &mut PipelineState) -> String {
        let sources = state.sources.clone();
        let mut records = Vec::with_capacity(sources.len());

        for source in sources {
            let mut input = source.clone();
            let mut name = source.kind.builtin_extractor().to_string();
            if let Some(format) = source.effective_format() {
                let candidate = extractor_name_for_format(&format);
                if self.registry.contains(&candidate) {
                    name = candidate;
                    input.format = Some(format);
                }
            }

            let Some(capability) = self.registry.lookup(&name) else {
                state.push_error(format!(
                    "data_extractor [{}]: no extractor registered as '{}'",
                    source.id, name
                ));
                continue;
            };

            let input = match serde_json::to_value(&input) {
                Ok(value) => value,
                Err(e) => {
                    state.push_error(format!("data_extractor [{}]: {}", source.id, e));
                    continue;
                }
            };

            tracing::debug!(source = %source.id, extractor = %name, "Extracting source");
            match self.invoke_bounded(&capability, input).await {
                Ok(payload) => records.push(ExtractedRecord {
                    source_id: source.id.clone(),
                    kind: source.kind,
                    payload,
                    extracted_at: Utc::now(),
                }),
                Err(e) => state.push_error(format!("data_extractor [{}]: {}", source.id, e)),
            }
        }

        let extracted = records.len();
        state.extracted_records = records;
        state.iteration += 1;
        format!(
            "extracted {}/{} sources on pass {}",
            extracted,
            state.sources.len(),
            state.iteration
        )
    }

    // ------------------------------------------------------------------
    // data_operator
    // ------------------------------------------------------------------

    async fn operate_on_data(&self, state: &mut PipelineState) -> String {
        if let Some(spec) = self.unsupported_format_spec(state) {
            let summary = format!("file format needs a new extractor '{}'", spec.name());
            state.needs_new_tool = true;
            state.capability_spec = Some(spec);
            return summary;
        }

        let rows: Vec<Value> = state
            .extracted_records
            .iter()
            .flat_map(|record| payload_rows(&record.payload))
            .collect();

        let operations = self.registry.names_of_kind(CapabilityKind::Operation);
        let sample = serde_json::to_string_pretty(&rows.iter().take(PLAN_SAMPLE_ROWS).collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_string());
        let prompt = build_operation_plan_prompt(&state.domain, &state.kpis, &operations, &sample);

        let plan = match self.consult(state, &prompt).await {
            Ok(object) => {
                if let Some(spec) = object.get("missing_capability").and_then(CapabilitySpec::from_plan) {
                    if self.registry.contains(spec.name()) {
                        tracing::debug!(capability = %spec.name(), "Declared missing capability is already registered");
                    } else if state.attempted_capabilities.iter().any(|n| n == spec.name()) {
                        tracing::info!(capability = %spec.name(), "Declared missing capability was already attempted this run");
                    } else {
                        let summary = format!("oracle declared missing operation '{}'", spec.name());
                        state.needs_new_tool = true;
                        state.capability_spec = Some(spec);
                        return summary;
                    }
                }
                match object.get("operations").and_then(Value::as_array) {
                    Some(steps) => steps.iter().filter_map(plan_step).collect(),
                    None => default_plan(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Operation plan unusable, falling back to normalize");
                default_plan()
            }
        };

        let input_rows = rows.len();
        let mut current = rows;
        let mut applied = 0usize;
        for (op, params) in plan {
            let Some(capability) = self.registry.lookup(&op) else {
                tracing::warn!(op = %op, "Planned operation is not registered, skipping");
                continue;
            };
            let input = json!({ "records": current.clone(), "params": params });
            match self.invoke_bounded(&capability, input).await {
                Ok(output) => {
                    current = payload_rows(&output);
                    applied += 1;
                }
                // rows from before the failed step carry on
                Err(e) => state.push_error(format!("data_operator [{}]: {}", op, e)),
            }
        }

        let output_rows = current.len();
        state.processed_records = current;
        format!(
            "applied {} operations: {} rows in, {} rows out",
            applied, input_rows, output_rows
        )
    }

    /// Spec for the first file format nothing can read natively, unless a
    /// synthesis for it was already attempted this run.
    fn unsupported_format_spec(&self, state: &mut PipelineState) -> Option<CapabilitySpec> {
        let mut seen = HashSet::new();
        let file_formats: Vec<(String, String)> = state
            .sources
            .iter()
            .filter(|s| s.kind == SourceKind::File)
            .filter_map(|s| s.effective_format().map(|f| (s.id.clone(), f)))
            .collect();
        for (source_id, format) in file_formats {
            if is_supported_file_format(&format) || !seen.insert(format.clone()) {
                continue;
            }
            let name = extractor_name_for_format(&format);
            if self.registry.contains(&name) || state.attempted_capabilities.contains(&name) {
                continue;
            }
            match CapabilitySpec::for_file_format(&format) {
                Ok(spec) => return Some(spec),
                Err(e) => {
                    state.push_error(format!("data_operator [{}]: {}", source_id, e));
                    state.attempted_capabilities.push(name);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // tool_builder_agent
    // ------------------------------------------------------------------

    async fn build_missing_tool(&self, state: &mut PipelineState) -> String {
        state.needs_new_tool = false;
        let Some(spec) = state.capability_spec.take() else {
            state.push_error("tool_builder_agent: no capability spec pending");
            return "nothing to build".to_string();
        };
        let name = spec.name().to_string();
        if !state.attempted_capabilities.contains(&name) {
            state.attempted_capabilities.push(name.clone());
        }

        let budget = self.config.synthesis_timeout;
        let mut result = match tokio::time::timeout(budget, self.synthesizer.synthesize(&spec)).await {
            Ok(result) => result,
            Err(_) => SynthesisResult::failed(&name, None, format!("synthesis timed out after {:?}", budget), 0),
        };
        self.metrics.set_registered_capabilities(self.registry.len());

        if result.is_success() && result.source.is_some() {
            match self.smoke_test(&spec).await {
                Ok(()) => result.validated = true,
                Err(detail) => {
                    self.registry.unregister(&name);
                    self.metrics.set_registered_capabilities(self.registry.len());
                    state.push_error(format!("tool_builder_agent [{}]: smoke test failed: {}", name, detail));
                }
            }
        } else if let Some(error) = result.error.as_deref() {
            state.push_error(format!("tool_builder_agent [{}]: {}", name, error));
        }

        let summary = format!(
            "capability '{}' {} after {} repairs (validated: {})",
            name, result.status, result.repair_attempts, result.validated
        );
        state.synthesis_result = Some(result);
        summary
    }

    /// Invoke the freshly registered capability once through the registry.
    async fn smoke_test(&self, spec: &CapabilitySpec) -> Result<(), String> {
        let capability = self
            .registry
            .lookup(spec.name())
            .ok_or_else(|| "capability is not registered".to_string())?;
        let probe = probe_inputs(spec).into_iter().next().unwrap_or(Value::Null);
        match self.invoke_bounded(&capability, probe).await {
            Ok(_) | Err(CapabilityError::ResourceNotFound(_)) | Err(CapabilityError::Reported(_)) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // rag_retriever
    // ------------------------------------------------------------------

    async fn retrieve_context(&self, state: &mut PipelineState) -> String {
        let queries = retrieval_queries(state);
        let top_k = self.config.rag_top_k;
        let timeout = self.config.stage_timeout;

        let lookups = queries.iter().map(|query| {
            let knowledge = Arc::clone(&self.knowledge);
            async move { tokio::time::timeout(timeout, knowledge.query(query, top_k)).await }
        });
        let results = futures::future::join_all(lookups).await;

        let mut chunks: Vec<String> = Vec::new();
        for result in results {
            match result {
                Ok(Ok(found)) => chunks.extend(found),
                Ok(Err(e)) => state.push_error(format!("rag_retriever: {}", e)),
                Err(_) => state.push_error(format!("rag_retriever: query timed out after {:?}", timeout)),
            }
        }

        let summary = format!("{} queries, {} chunks", queries.len(), chunks.len());
        state.rag_queries = queries;
        state.rag_chunks = chunks;
        summary
    }

    // ------------------------------------------------------------------
    // data_consolidator
    // ------------------------------------------------------------------

    fn consolidate_data(&self, state: &mut PipelineState) -> String {
        let dataset = match consolidate(
            &state.processed_records,
            &state.rag_chunks,
            &state.domain,
            &state.reporting_period,
            &state.kpis,
        ) {
            Ok(dataset) => dataset,
            Err(e) => {
                state.push_error(format!("data_consolidator: {}", e));
                fallback_dataset(
                    &state.processed_records,
                    &state.rag_chunks,
                    &state.domain,
                    &state.reporting_period,
                    &state.kpis,
                )
            }
        };
        let summary = format!(
            "{} records, {} numeric fields, {} KPI rollups{}",
            dataset.record_count,
            dataset.field_stats.len(),
            dataset.kpi_rollups.len(),
            if dataset.fallback { " (fallback)" } else { "" }
        );
        state.consolidated = Some(dataset);
        summary
    }

    // ------------------------------------------------------------------
    // triz_analyzer
    // ------------------------------------------------------------------

    async fn analyze_triz(&self, state: &mut PipelineState) -> String {
        let dataset = state
            .consolidated
            .as_ref()
            .and_then(|d| serde_json::to_string(d).ok())
            .unwrap_or_else(|| "{}".to_string());
        let prompt = build_triz_prompt(
            &state.domain,
            &state.reporting_period,
            &state.kpis,
            &dataset,
            state.iteration,
        );

        match self.consult(state, &prompt).await {
            Ok(object) => {
                state.triz = parse_triz(&object);
                state.key_findings = string_list(object.get("key_findings"));
                state.recommendations = object
                    .get("recommendations")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(parse_recommendation).collect())
                    .unwrap_or_default();
                state.set_confidence_score(number_field(&object, "confidence_score").unwrap_or(0.5));
                state.confidence_rationale = text_field(&object, "confidence_rationale").unwrap_or_default();
            }
            Err(e) => {
                state.push_error(oracle_failure("triz_analyzer", &e));
                state.triz = TrizAnalysis::default();
                state.key_findings.clear();
                state.recommendations.clear();
                state.set_confidence_score(0.0);
                state.confidence_rationale = String::new();
            }
        }

        state.degraded_report = is_degraded_after_triz(state.confidence_score, state.iteration);
        let next = route_after_triz(state.confidence_score, state.iteration);
        state.record_decision(
            Stage::TrizAnalyzer,
            format!("confidence={:.2}, iteration={}", state.confidence_score, state.iteration),
            next.as_str(),
            state.confidence_rationale.clone(),
        );

        format!(
            "{} contradictions, {} principles, {} recommendations, confidence {:.2}",
            state.triz.contradictions.len(),
            state.triz.principles.len(),
            state.recommendations.len(),
            state.confidence_score
        )
    }

    // ------------------------------------------------------------------
    // error_handler
    // ------------------------------------------------------------------

    fn handle_errors(&self, state: &mut PipelineState) -> String {
        state.degraded_report = state.iteration >= MAX_REFINEMENT_ITERATIONS;
        let next = route_after_error(state.iteration);
        let rationale = if state.degraded_report {
            "Max retries reached; generating degraded report"
        } else {
            "Retrying extraction"
        };
        state.record_decision(
            Stage::ErrorHandler,
            format!("iteration={}, errors={}", state.iteration, state.errors.len()),
            next.as_str(),
            rationale,
        );
        format!("{} errors so far; {}", state.errors.len(), rationale.to_lowercase())
    }

    // ------------------------------------------------------------------
    // report_generator
    // ------------------------------------------------------------------

    fn generate_report(&self, state: &mut PipelineState) -> String {
        let report = assemble_report(state, Utc::now());
        let out_dir = self.output_dir().to_path_buf();

        let charts = match render_charts(&report, &out_dir) {
            Ok(paths) => paths,
            Err(e) => {
                state.push_error(format!("report_generator [charts]: {}", e));
                Vec::new()
            }
        };

        let formats: Vec<String> = state.output_formats.iter().cloned().collect();
        for format in formats {
            let rendered = match self.renderers.get(&format) {
                Some(renderer) => renderer.render(&report, &charts, &out_dir),
                None => Err(RenderError::UnknownFormat(format.clone())),
            };
            match rendered {
                Ok(artifact) => {
                    state.artifacts.insert(format, artifact);
                }
                Err(e) => {
                    self.metrics.record_render_failure(&format);
                    state.push_error(format!("report_generator [{}]: {}", format, e));
                }
            }
        }

        let summary = format!(
            "rendered {}/{} formats{}",
            state.artifacts.len(),
            state.output_formats.len(),
            if report.is_degraded() { " (degraded)" } else { "" }
        );
        state.report = Some(report);
        if let Err(e) = state.transition_to(RunStatus::Done) {
            state.push_error(format!("report_generator: {}", e));
        }
        summary
    }
}

fn oracle_failure(stage: &str, error: &OracleError) -> String {
    if error.is_malformed() {
        format!("{}: oracle returned malformed output", stage)
    } else {
        format!("{}: {}", stage, error)
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    match object.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::String(_) | Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn default_plan() -> Vec<(String, Value)> {
    vec![(DEFAULT_OPERATION.to_string(), json!({}))]
}

fn plan_step(step: &Value) -> Option<(String, Value)> {
    let op = step.get("op").and_then(Value::as_str)?.trim();
    if op.is_empty() {
        return None;
    }
    let params = step
        .get("params")
        .filter(|p| p.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    Some((op.to_string(), params))
}

fn retrieval_queries(state: &PipelineState) -> Vec<String> {
    let top_kpis: Vec<&str> = state.kpis.iter().take(3).map(String::as_str).collect();
    let mut queries = vec![
        format!("{} activity report benchmarks {}", state.domain, state.reporting_period),
        format!("{} KPI standards: {}", state.domain, top_kpis.join(", ")),
        format!("historical trends {} {}", state.domain, state.reporting_period),
    ];
    if let Some(instruction) = state
        .user_instruction
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
    {
        queries.push(instruction.to_string());
    }
    queries
}

fn parse_triz(object: &Map<String, Value>) -> TrizAnalysis {
    let contradictions = object
        .get("contradictions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|c| Contradiction {
                    kind: match c.get("type").and_then(Value::as_str).map(str::to_lowercase).as_deref() {
                        Some("physical") => ContradictionKind::Physical,
                        _ => ContradictionKind::Technical,
                    },
                    improving: text_field(c, "improving_parameter").unwrap_or_default(),
                    degrading: text_field(c, "degrading_parameter").unwrap_or_default(),
                    description: text_field(c, "description").unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let principles = object
        .get("triz_principles_applied")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|p| AppliedPrinciple {
                    number: number_field(p, "principle_number")
                        .filter(|n| *n >= 0.0)
                        .map(|n| n as u32)
                        .unwrap_or(0),
                    name: text_field(p, "name").unwrap_or_default(),
                    application: text_field(p, "application").unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    TrizAnalysis {
        contradictions,
        ideal_final_result: text_field(object, "ideal_final_result").unwrap_or_default(),
        principles,
        root_causes: string_list(object.get("root_causes")),
        cross_analysis: object.get("cross_analysis").cloned().unwrap_or(Value::Null),
    }
}

fn parse_recommendation(value: &Value) -> Option<Recommendation> {
    match value {
        Value::Object(r) => Some(Recommendation {
            action: text_field(r, "action")?,
            owner: text_field(r, "owner").unwrap_or_default(),
            timeline: text_field(r, "timeline").unwrap_or_default(),
            priority: Priority::parse_lenient(&text_field(r, "priority").unwrap_or_default()),
        }),
        Value::String(action) if !action.trim().is_empty() => Some(Recommendation {
            action: action.trim().to_string(),
            owner: String::new(),
            timeline: String::new(),
            priority: Priority::parse_lenient(""),
        }),
        _ => None,
    }
}
