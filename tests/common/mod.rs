//! Shared fixtures for the integration tests: a scripted LLM that answers by
//! task banner and an in-process sandbox that never spawns an interpreter.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use aria_forge::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use aria_forge::pipeline::{PipelineConfig, PipelineOrchestrator};
use aria_forge::synthesis::{SandboxError, SandboxOutcome, SandboxRunner};
use aria_forge::LlmError;

pub const DOMAIN: &str = "TASK: DOMAIN IDENTIFICATION";
pub const PLAN: &str = "TASK: OPERATION PLANNING";
pub const TRIZ: &str = "TASK: TRIZ ANALYSIS";
pub const GENERATE: &str = "TASK: CAPABILITY GENERATION";
pub const REPAIR: &str = "TASK: CAPABILITY REPAIR";
pub const SUMMARY: &str = "TASK: CONVERSATION SUMMARY";

/// LLM answering from per-banner queues.
///
/// The banner is the last `TASK: ...` line of the user message, so context
/// carried over from earlier calls does not confuse routing. A queue's last
/// answer repeats forever.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, banner: &str, response: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(banner.to_string())
            .or_default()
            .push_back(response.into());
        self
    }

    pub fn on_json(self, banner: &str, response: Value) -> Self {
        self.on(banner, response.to_string())
    }

    pub fn calls(&self, banner: &str) -> usize {
        self.calls.lock().unwrap().get(banner).copied().unwrap_or(0)
    }

    fn banner_of(text: &str) -> String {
        match text.rfind("TASK: ") {
            Some(start) => text[start..].lines().next().unwrap_or_default().trim().to_string(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let banner = Self::banner_of(&user);
        *self.calls.lock().unwrap().entry(banner.clone()).or_insert(0) += 1;

        let content = {
            let mut responses = self.responses.lock().unwrap();
            let queue = responses.get_mut(&banner).ok_or_else(|| LlmError::ApiError {
                code: 500,
                message: format!("no scripted response for '{}'", banner),
            })?;
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            }
        };

        Ok(GenerationResponse {
            id: "scripted".to_string(),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        })
    }
}

/// Sandbox interpreting a few markers in the source instead of running it.
///
/// - `SYNTAX_ERROR` fails to load
/// - no `def <name>` means the callable is missing
/// - `RAISE` raises on every input
/// - extractors return two fixed rows for existing files and a not-found
///   error otherwise; operations echo nothing
#[derive(Default)]
pub struct FakeSandbox {
    runs: AtomicUsize,
}

impl FakeSandbox {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

pub fn xml_rows() -> Value {
    json!({
        "rows": [
            {"region": "north", "revenue": 120.0},
            {"region": "south", "revenue": 80.0}
        ],
        "columns": ["region", "revenue"]
    })
}

#[async_trait]
impl SandboxRunner for FakeSandbox {
    async fn run(&self, source: &str, function_name: &str, input: &Value) -> Result<SandboxOutcome, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if source.contains("SYNTAX_ERROR") {
            return Ok(SandboxOutcome::LoadFailed("SyntaxError: invalid syntax".to_string()));
        }
        if !source.contains(&format!("def {}", function_name)) {
            return Ok(SandboxOutcome::MissingCallable);
        }
        if source.contains("RAISE") {
            return Ok(SandboxOutcome::Raised("ValueError: boom".to_string()));
        }
        if !function_name.starts_with("extract_") {
            return Ok(SandboxOutcome::Returned(json!({"rows": [], "columns": []})));
        }
        let Some(location) = input.get("location").and_then(Value::as_str) else {
            return Ok(SandboxOutcome::ArgumentMismatch("KeyError: 'location'".to_string()));
        };
        if !Path::new(location).exists() {
            return Ok(SandboxOutcome::ResourceNotFound(format!("FileNotFoundError: {}", location)));
        }
        Ok(SandboxOutcome::Returned(xml_rows()))
    }
}

pub fn domain_answer(confidence: f64) -> Value {
    json!({
        "reasoning": "columns name regions and monthly revenue",
        "domain": "retail sales",
        "reporting_period": "Q3 2024",
        "kpis": ["revenue", "units"],
        "domain_confidence": confidence,
        "needs_research_agent": false,
        "clarification_question": null
    })
}

pub fn plan_answer() -> Value {
    json!({
        "reasoning": "scale revenue for comparison",
        "operations": [{"op": "normalize", "params": {}}],
        "missing_capability": null
    })
}

pub fn triz_answer(confidence: f64) -> Value {
    json!({
        "reasoning": "north outsells south",
        "contradictions": [
            {"type": "technical", "improving_parameter": "coverage", "degrading_parameter": "cost", "description": "more stores cost more"}
        ],
        "ideal_final_result": "revenue grows without new stores",
        "triz_principles_applied": [{"principle_number": 1, "name": "Segmentation", "application": "split regions"}],
        "root_causes": ["uneven staffing"],
        "cross_analysis": {"insights": ["north leads"]},
        "key_findings": ["North revenue is 50% above south"],
        "recommendations": [{"action": "Rebalance staff", "owner": "Ops", "timeline": "Q4", "priority": "High"}],
        "confidence_score": confidence,
        "confidence_rationale": "two regions only"
    })
}

pub fn generated_code(name: &str) -> Value {
    json!({
        "reasoning": "parse records",
        "code": format!("def {}(source):\n    return {{'rows': [], 'columns': []}}\n", name)
    })
}

/// LLM scripted for a clean run at the given confidences.
pub fn happy_llm(domain_confidence: f64, triz_confidence: f64) -> ScriptedLlm {
    ScriptedLlm::new()
        .on_json(DOMAIN, domain_answer(domain_confidence))
        .on_json(PLAN, plan_answer())
        .on_json(TRIZ, triz_answer(triz_confidence))
        .on(SUMMARY, "Earlier turns identified the domain.")
}

pub fn write_sales_csv(dir: &Path) -> String {
    let path = dir.join("sales.csv");
    std::fs::write(
        &path,
        "region,month,revenue,units\nnorth,2024-07,120,12\nsouth,2024-07,80,9\nnorth,2024-08,130,14\n",
    )
    .unwrap();
    path.display().to_string()
}

pub fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig::default()
        .with_output_dir(dir.join("reports"))
        .with_capability_dir(dir.join("capabilities"))
        .with_checkpoint_dir(dir.join("checkpoints"))
}

pub fn orchestrator(dir: &Path, llm: Arc<ScriptedLlm>, sandbox: Arc<FakeSandbox>) -> PipelineOrchestrator {
    PipelineOrchestrator::builder(test_config(dir))
        .provider(llm)
        .sandbox(sandbox)
        .build()
        .unwrap()
}
