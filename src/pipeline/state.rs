//! Run state carried from stage to stage.
//!
//! [`PipelineState`] is the single record every stage reads and writes. It is
//! serialized whole into the checkpoint store when a run suspends, so every
//! field here is `Serialize + Deserialize`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::memory::ConversationMemory;
use crate::report::{RenderedArtifact, Report};
use crate::synthesis::{CapabilitySpec, SynthesisResult};
use crate::tools::ConsolidatedDataset;

/// Output formats rendered when a request names none.
pub const DEFAULT_OUTPUT_FORMATS: &[&str] = &["json", "markdown", "html", "pdf", "pptx"];

// ============================================================================
// Stages and status
// ============================================================================

/// Nodes of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DomainIdentifier,
    HumanCheckpoint,
    ResearchAgent,
    DataExtractor,
    DataOperator,
    ToolBuilderAgent,
    RagRetriever,
    DataConsolidator,
    TrizAnalyzer,
    ErrorHandler,
    ReportGenerator,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::DomainIdentifier,
        Stage::HumanCheckpoint,
        Stage::ResearchAgent,
        Stage::DataExtractor,
        Stage::DataOperator,
        Stage::ToolBuilderAgent,
        Stage::RagRetriever,
        Stage::DataConsolidator,
        Stage::TrizAnalyzer,
        Stage::ErrorHandler,
        Stage::ReportGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DomainIdentifier => "domain_identifier",
            Stage::HumanCheckpoint => "human_checkpoint",
            Stage::ResearchAgent => "research_agent",
            Stage::DataExtractor => "data_extractor",
            Stage::DataOperator => "data_operator",
            Stage::ToolBuilderAgent => "tool_builder_agent",
            Stage::RagRetriever => "rag_retriever",
            Stage::DataConsolidator => "data_consolidator",
            Stage::TrizAnalyzer => "triz_analyzer",
            Stage::ErrorHandler => "error_handler",
            Stage::ReportGenerator => "report_generator",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::ReportGenerator)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingForHuman,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Staying in the same status is always allowed; terminal statuses are
    /// never left.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::WaitingForHuman)
                | (RunStatus::Running, RunStatus::Done)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::WaitingForHuman, RunStatus::Running)
                | (RunStatus::WaitingForHuman, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::WaitingForHuman => "waiting_for_human",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An illegal status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

// ============================================================================
// Sources and records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Database,
    Api,
    Web,
}

impl SourceKind {
    /// Name of the built-in extractor for this kind.
    pub fn builtin_extractor(&self) -> &'static str {
        match self {
            SourceKind::File => "extract_from_file",
            SourceKind::Database => "extract_from_database",
            SourceKind::Api => "extract_from_api",
            SourceKind::Web => "extract_from_web",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::File => "file",
            SourceKind::Database => "database",
            SourceKind::Api => "api",
            SourceKind::Web => "web",
        };
        f.write_str(s)
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "database" | "db" => Ok(SourceKind::Database),
            "api" => Ok(SourceKind::Api),
            "web" => Ok(SourceKind::Web),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

/// One input source of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    /// Path or URL.
    pub location: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            location: location.into(),
            format: None,
            metadata: Map::new(),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into().to_lowercase());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Declared format, or the file extension for file sources.
    pub fn effective_format(&self) -> Option<String> {
        match self.kind {
            SourceKind::File => crate::tools::effective_file_format(&self.location, self.format.as_deref()),
            _ => self.format.clone(),
        }
    }
}

/// Payload extracted from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub source_id: String,
    pub kind: SourceKind,
    pub payload: Value,
    pub extracted_at: DateTime<Utc>,
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionKind {
    Technical,
    Physical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub kind: ContradictionKind,
    pub improving: String,
    pub degrading: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPrinciple {
    pub number: u32,
    pub name: String,
    pub application: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrizAnalysis {
    pub contradictions: Vec<Contradiction>,
    pub ideal_final_result: String,
    pub principles: Vec<AppliedPrinciple>,
    pub root_causes: Vec<String>,
    pub cross_analysis: Value,
}

impl TrizAnalysis {
    pub fn is_empty(&self) -> bool {
        self.contradictions.is_empty()
            && self.principles.is_empty()
            && self.root_causes.is_empty()
            && self.ideal_final_result.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lenient parse of an oracle-supplied priority; unknown values are medium.
    pub fn parse_lenient(text: &str) -> Self {
        match text.trim().to_lowercase().as_str() {
            "high" | "critical" | "urgent" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    pub owner: String,
    pub timeline: String,
    pub priority: Priority,
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Completed,
    /// The stage finished but appended errors.
    CompletedWithErrors,
}

/// One executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageVisit {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub status: VisitStatus,
    pub summary: String,
    /// `iteration` right after the stage ran.
    pub iteration: u32,
}

/// One evaluated branch condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub stage: Stage,
    pub condition: String,
    pub outcome: String,
    pub rationale: String,
}

// ============================================================================
// PipelineState
// ============================================================================

/// The full record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    // input
    pub sources: Vec<SourceDescriptor>,
    pub user_instruction: Option<String>,
    pub output_formats: BTreeSet<String>,

    // domain context
    pub domain: String,
    pub domain_confidence: f64,
    pub reporting_period: String,
    pub kpis: Vec<String>,
    pub clarification_question: Option<String>,
    pub needs_research: bool,

    // data pipeline
    pub extracted_records: Vec<ExtractedRecord>,
    pub processed_records: Vec<Value>,
    pub consolidated: Option<ConsolidatedDataset>,
    pub needs_new_tool: bool,
    pub capability_spec: Option<CapabilitySpec>,
    pub synthesis_result: Option<SynthesisResult>,
    /// Capabilities already synthesized (or attempted) during this run.
    pub attempted_capabilities: Vec<String>,

    // retrieval
    pub rag_queries: Vec<String>,
    pub rag_chunks: Vec<String>,

    // analysis
    pub triz: TrizAnalysis,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<Recommendation>,
    pub confidence_score: f64,
    pub confidence_rationale: String,
    pub degraded_report: bool,

    // control and audit
    pub iteration: u32,
    pub errors: Vec<String>,
    pub stage_history: Vec<StageVisit>,
    pub decisions: Vec<RoutingDecision>,
    pub current_stage: Option<Stage>,
    pub status: RunStatus,
    pub thread_id: String,
    pub started_at: DateTime<Utc>,

    pub conversation: ConversationMemory,

    // output
    pub report: Option<Report>,
    pub artifacts: BTreeMap<String, RenderedArtifact>,
}

impl PipelineState {
    /// Fresh state for a new run.
    pub fn new(
        thread_id: impl Into<String>,
        sources: Vec<SourceDescriptor>,
        output_formats: BTreeSet<String>,
        user_instruction: Option<String>,
    ) -> Self {
        let output_formats = if output_formats.is_empty() {
            DEFAULT_OUTPUT_FORMATS.iter().map(|f| f.to_string()).collect()
        } else {
            output_formats
        };
        Self {
            sources,
            user_instruction,
            output_formats,
            domain: String::new(),
            domain_confidence: 0.0,
            reporting_period: String::new(),
            kpis: Vec::new(),
            clarification_question: None,
            needs_research: false,
            extracted_records: Vec::new(),
            processed_records: Vec::new(),
            consolidated: None,
            needs_new_tool: false,
            capability_spec: None,
            synthesis_result: None,
            attempted_capabilities: Vec::new(),
            rag_queries: Vec::new(),
            rag_chunks: Vec::new(),
            triz: TrizAnalysis::default(),
            key_findings: Vec::new(),
            recommendations: Vec::new(),
            confidence_score: 0.0,
            confidence_rationale: String::new(),
            degraded_report: false,
            iteration: 0,
            errors: Vec::new(),
            stage_history: Vec::new(),
            decisions: Vec::new(),
            current_stage: None,
            status: RunStatus::Running,
            thread_id: thread_id.into(),
            started_at: Utc::now(),
            conversation: ConversationMemory::new(),
            report: None,
            artifacts: BTreeMap::new(),
        }
    }

    /// Change status, refusing illegal transitions.
    pub fn transition_to(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            tracing::debug!(thread_id = %self.thread_id, from = %self.status, to = %next, "Run status changed");
        }
        self.status = next;
        Ok(())
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!(thread_id = %self.thread_id, error = %error, "Stage error recorded");
        self.errors.push(error);
    }

    pub fn set_domain_confidence(&mut self, confidence: f64) {
        self.domain_confidence = clamp_unit(confidence);
    }

    pub fn set_confidence_score(&mut self, confidence: f64) {
        self.confidence_score = clamp_unit(confidence);
    }

    pub fn record_visit(&mut self, stage: Stage, status: VisitStatus, summary: impl Into<String>) {
        self.stage_history.push(StageVisit {
            stage,
            timestamp: Utc::now(),
            status,
            summary: summary.into(),
            iteration: self.iteration,
        });
    }

    pub fn record_decision(
        &mut self,
        stage: Stage,
        condition: impl Into<String>,
        outcome: impl Into<String>,
        rationale: impl Into<String>,
    ) {
        self.decisions.push(RoutingDecision {
            stage,
            condition: condition.into(),
            outcome: outcome.into(),
            rationale: rationale.into(),
        });
    }

    /// Stages visited so far, in order.
    pub fn path(&self) -> Vec<Stage> {
        self.stage_history.iter().map(|visit| visit.stage).collect()
    }
}

/// Clamp into `[0, 1]`; NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
