//! Fold of the final run state into a [`Report`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::state::{PipelineState, Recommendation, TrizAnalysis};
use crate::tools::ConsolidatedDataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub domain: String,
    pub reporting_period: String,
    pub kpis: Vec<String>,
    pub data_sources: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub consolidated_dataset: Option<ConsolidatedDataset>,
    pub rag_chunks_used: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSection {
    pub score: f64,
    /// `score` as a whole percentage.
    pub percent: u32,
    pub degraded: bool,
    pub rationale: String,
}

/// The six-section report. Sections serialize in order under their numbered keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub thread_id: String,
    pub title: String,
    #[serde(rename = "1_overview")]
    pub overview: Overview,
    #[serde(rename = "2_data_summary")]
    pub data_summary: DataSummary,
    #[serde(rename = "3_triz_analysis")]
    pub triz_analysis: TrizAnalysis,
    #[serde(rename = "4_key_findings")]
    pub key_findings: Vec<String>,
    #[serde(rename = "5_recommendations")]
    pub recommendations: Vec<Recommendation>,
    #[serde(rename = "6_confidence")]
    pub confidence: ConfidenceSection,
}

impl Report {
    pub fn is_degraded(&self) -> bool {
        self.overview.degraded
    }

    /// File stem shared by every artifact of this report.
    pub fn file_stem(&self) -> String {
        let id: String = self
            .thread_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("aria_report_{}", id)
    }

    /// Average per KPI, falling back to every field's average.
    pub fn chart_series(&self) -> Vec<(String, f64)> {
        let Some(dataset) = &self.data_summary.consolidated_dataset else {
            return Vec::new();
        };
        let source = if dataset.kpi_rollups.is_empty() {
            &dataset.field_stats
        } else {
            &dataset.kpi_rollups
        };
        source.iter().map(|(name, rollup)| (name.clone(), rollup.avg)).collect()
    }
}

/// Build the report from the state. Pure: the same state gives the same report.
pub fn assemble_report(state: &PipelineState, generated_at: DateTime<Utc>) -> Report {
    let domain = if state.domain.is_empty() {
        "unknown".to_string()
    } else {
        state.domain.clone()
    };
    let title = if state.reporting_period.is_empty() {
        format!("Activity report: {}", domain)
    } else {
        format!("Activity report: {} ({})", domain, state.reporting_period)
    };

    Report {
        thread_id: state.thread_id.clone(),
        title,
        overview: Overview {
            domain,
            reporting_period: state.reporting_period.clone(),
            kpis: state.kpis.clone(),
            data_sources: state
                .sources
                .iter()
                .map(|s| format!("{} ({}: {})", s.id, s.kind, s.location))
                .collect(),
            generated_at,
            degraded: state.degraded_report,
        },
        data_summary: DataSummary {
            consolidated_dataset: state.consolidated.clone(),
            rag_chunks_used: state.rag_chunks.len(),
        },
        triz_analysis: state.triz.clone(),
        key_findings: state.key_findings.clone(),
        recommendations: state.recommendations.clone(),
        confidence: ConfidenceSection {
            score: state.confidence_score,
            percent: (state.confidence_score * 100.0).round() as u32,
            degraded: state.degraded_report,
            rationale: state.confidence_rationale.clone(),
        },
    }
}
