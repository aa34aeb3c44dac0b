//! Deterministic merge of processed rows and retrieved context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use super::rows::{as_number, round4};

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("field '{field}' contains a non-finite value")]
    NonFiniteValue { field: String },
}

/// count/sum/avg/min/max over the numeric values of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl Rollup {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            count: values.len(),
            sum: round4(sum),
            avg: round4(sum / values.len() as f64),
            min: round4(values.iter().copied().fold(f64::INFINITY, f64::min)),
            max: round4(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        })
    }
}

/// The single dataset handed to analysis and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedDataset {
    pub domain: String,
    pub reporting_period: String,
    pub kpis: Vec<String>,
    pub records: Vec<Value>,
    pub record_count: usize,
    pub field_stats: BTreeMap<String, Rollup>,
    /// Rollups of every field whose name contains the KPI (snake_cased).
    pub kpi_rollups: BTreeMap<String, Rollup>,
    pub rag_context: Vec<String>,
    pub rag_chunks_used: usize,
    pub consolidated_at: DateTime<Utc>,
    /// Set when consolidation failed and the raw rows were passed through.
    #[serde(default)]
    pub fallback: bool,
}

/// Merge rows and context into a [`ConsolidatedDataset`].
///
/// Stats cover the union of fields across all rows. Non-object rows are
/// ignored.
pub fn consolidate(
    processed: &[Value],
    rag_context: &[String],
    domain: &str,
    reporting_period: &str,
    kpis: &[String],
) -> Result<ConsolidatedDataset, ConsolidationError> {
    let records: Vec<Value> = processed.iter().filter(|r| r.is_object()).cloned().collect();

    let mut numeric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in &records {
        let Some(object) = record.as_object() else {
            continue;
        };
        for (field, value) in object {
            if let Some(n) = as_number(value) {
                if !n.is_finite() {
                    return Err(ConsolidationError::NonFiniteValue {
                        field: field.clone(),
                    });
                }
                numeric.entry(field.clone()).or_default().push(n);
            }
        }
    }

    let field_stats: BTreeMap<String, Rollup> = numeric
        .iter()
        .filter_map(|(field, values)| Rollup::from_values(values).map(|r| (field.clone(), r)))
        .collect();

    let kpi_rollups: BTreeMap<String, Rollup> = kpis
        .iter()
        .filter_map(|kpi| {
            let needle = kpi.trim().to_lowercase().replace(' ', "_");
            if needle.is_empty() {
                return None;
            }
            let values: Vec<f64> = numeric
                .iter()
                .filter(|(field, _)| field.to_lowercase().contains(&needle))
                .flat_map(|(_, values)| values.iter().copied())
                .collect();
            Rollup::from_values(&values).map(|r| (kpi.clone(), r))
        })
        .collect();

    Ok(ConsolidatedDataset {
        domain: domain.to_string(),
        reporting_period: reporting_period.to_string(),
        kpis: kpis.to_vec(),
        record_count: records.len(),
        records,
        field_stats,
        kpi_rollups,
        rag_chunks_used: rag_context.len(),
        rag_context: rag_context.to_vec(),
        consolidated_at: Utc::now(),
        fallback: false,
    })
}

/// Pass-through dataset used when [`consolidate`] fails.
pub fn fallback_dataset(
    processed: &[Value],
    rag_context: &[String],
    domain: &str,
    reporting_period: &str,
    kpis: &[String],
) -> ConsolidatedDataset {
    ConsolidatedDataset {
        domain: domain.to_string(),
        reporting_period: reporting_period.to_string(),
        kpis: kpis.to_vec(),
        records: processed.to_vec(),
        record_count: processed.len(),
        field_stats: BTreeMap::new(),
        kpi_rollups: BTreeMap::new(),
        rag_context: rag_context.to_vec(),
        rag_chunks_used: rag_context.len(),
        consolidated_at: Utc::now(),
        fallback: true,
    }
}
