//! Built-in row operations: filter, aggregate, normalize, compare.
//!
//! Each operation takes `{"records": [...], "params": {...}}` and returns the
//! rows/columns contract. Parameters are deserialized into typed structs so a
//! malformed plan from the oracle fails with a clear `InvalidInput`.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::rows::{
    as_number, display_value, number_value, params_from_input, records_from_input, round4,
    rows_output, Row,
};
use crate::error::CapabilityError;
use crate::registry::{Capability, CapabilityKind, CapabilityShape};

/// Names of the built-in operations.
pub const BUILTIN_OPERATIONS: &[&str] = &["filter", "aggregate", "normalize", "compare"];

fn parse_params<T: DeserializeOwned + Default>(params: Map<String, Value>) -> Result<T, CapabilityError> {
    if params.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_value(Value::Object(params))
        .map_err(|e| CapabilityError::InvalidInput(format!("invalid params: {}", e)))
}

macro_rules! row_operation {
    ($ty:ident, $name:literal, $description:literal, $params:ty, $apply:path) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        #[async_trait]
        impl Capability for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn description(&self) -> &str {
                $description
            }

            fn kind(&self) -> CapabilityKind {
                CapabilityKind::Operation
            }

            fn shape(&self) -> CapabilityShape {
                CapabilityShape::row_operation()
            }

            async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
                let records = records_from_input(&input)?;
                let params: $params = parse_params(params_from_input(&input))?;
                Ok(rows_output($apply(records, &params)?))
            }
        }
    };
}

row_operation!(
    FilterOperation,
    "filter",
    "Keep rows matching field conditions and a date range, optionally projecting fields",
    FilterParams,
    filter_rows
);
row_operation!(
    AggregateOperation,
    "aggregate",
    "Group rows and compute sum/avg/count/min/max metrics",
    AggregateParams,
    aggregate_rows
);
row_operation!(
    NormalizeOperation,
    "normalize",
    "Rename columns and scale numeric fields (minmax or zscore)",
    NormalizeParams,
    normalize_rows
);
row_operation!(
    CompareOperation,
    "compare",
    "Benchmark rows against KPI targets or a historical baseline",
    CompareParams,
    compare_rows
);

// ============================================================================
// filter
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Case-insensitive equality conditions.
    pub conditions: Map<String, Value>,
    pub date_field: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// Projection; keep every field when absent.
    pub fields: Option<Vec<String>>,
}

pub fn filter_rows(rows: Vec<Row>, params: &FilterParams) -> Result<Vec<Row>, CapabilityError> {
    let date_from = params.date_from.as_deref().map(parse_date).transpose()?;
    let date_to = params.date_to.as_deref().map(parse_date).transpose()?;

    let kept = rows
        .into_iter()
        .filter(|row| {
            params.conditions.iter().all(|(field, expected)| {
                let actual = row.get(field).map(display_value).unwrap_or_default();
                actual.to_lowercase() == display_value(expected).to_lowercase()
            })
        })
        .filter(|row| {
            let Some(field) = params.date_field.as_deref() else {
                return true;
            };
            let Some(date) = row.get(field).and_then(row_date) else {
                return true;
            };
            date_from.map_or(true, |from| date >= from) && date_to.map_or(true, |to| date <= to)
        })
        .map(|row| match &params.fields {
            Some(fields) => row
                .into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect(),
            None => row,
        })
        .collect();
    Ok(kept)
}

fn parse_date(text: &str) -> Result<NaiveDate, CapabilityError> {
    let head: String = text.chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .map_err(|e| CapabilityError::InvalidInput(format!("invalid date '{}': {}", text, e)))
}

fn row_date(value: &Value) -> Option<NaiveDate> {
    value.as_str().and_then(|s| parse_date(s).ok())
}

// ============================================================================
// aggregate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl MetricOp {
    fn label(self) -> &'static str {
        match self {
            MetricOp::Sum => "sum",
            MetricOp::Avg => "avg",
            MetricOp::Count => "count",
            MetricOp::Min => "min",
            MetricOp::Max => "max",
        }
    }

    fn apply(self, values: &[f64]) -> Value {
        if values.is_empty() {
            return Value::Null;
        }
        let sum: f64 = values.iter().sum();
        match self {
            MetricOp::Sum => number_value(round4(sum)),
            MetricOp::Avg => number_value(round4(sum / values.len() as f64)),
            MetricOp::Count => Value::from(values.len()),
            MetricOp::Min => number_value(values.iter().copied().fold(f64::INFINITY, f64::min)),
            MetricOp::Max => number_value(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricSpec {
    pub field: String,
    #[serde(default = "default_metric_op")]
    pub op: MetricOp,
}

fn default_metric_op() -> MetricOp {
    MetricOp::Sum
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AggregateParams {
    pub group_by: Option<String>,
    pub metrics: Vec<MetricSpec>,
    pub sort_by: Option<String>,
    pub descending: bool,
    pub top_n: Option<usize>,
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self {
            group_by: None,
            metrics: Vec::new(),
            sort_by: None,
            descending: true,
            top_n: None,
        }
    }
}

fn numeric_values(rows: &[&Row], field: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| row.get(field).and_then(as_number))
        .collect()
}

pub fn aggregate_rows(rows: Vec<Row>, params: &AggregateParams) -> Result<Vec<Row>, CapabilityError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let Some(group_by) = params.group_by.as_deref() else {
        let all: Vec<&Row> = rows.iter().collect();
        let mut agg = Map::new();
        agg.insert("_all".to_string(), Value::Bool(true));
        for metric in &params.metrics {
            let values = numeric_values(&all, &metric.field);
            agg.insert(format!("{}_{}", metric.op.label(), metric.field), metric.op.apply(&values));
        }
        return Ok(vec![agg]);
    };

    // Group keys keep first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, (Value, Vec<&Row>)> = BTreeMap::new();
    for row in &rows {
        let key_value = row
            .get(group_by)
            .cloned()
            .unwrap_or_else(|| Value::String("__unknown__".to_string()));
        let key = display_value(&key_value);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups
            .entry(key)
            .or_insert_with(|| (key_value, Vec::new()))
            .1
            .push(row);
    }

    let mut result: Vec<Row> = order
        .iter()
        .filter_map(|key| groups.get(key))
        .map(|(key_value, members)| {
            let mut agg = Map::new();
            agg.insert(group_by.to_string(), key_value.clone());
            agg.insert("count".to_string(), Value::from(members.len()));
            for metric in &params.metrics {
                let values = numeric_values(members, &metric.field);
                agg.insert(format!("{}_{}", metric.op.label(), metric.field), metric.op.apply(&values));
            }
            agg
        })
        .collect();

    if let Some(sort_by) = params.sort_by.as_deref() {
        result.sort_by(|a, b| {
            let ordering = compare_values(a.get(sort_by), b.get(sort_by));
            if params.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    if let Some(top_n) = params.top_n {
        result.truncate(top_n);
    }
    Ok(result)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(as_number), b.and_then(as_number)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => {
            let x = a.map(display_value).unwrap_or_default();
            let y = b.map(display_value).unwrap_or_default();
            x.cmp(&y)
        }
    }
}

// ============================================================================
// normalize
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMethod {
    #[default]
    Minmax,
    Zscore,
    None,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NormalizeParams {
    pub method: NormalizeMethod,
    /// Fields to scale; auto-detected numeric fields when absent.
    #[serde(alias = "numeric_fields")]
    pub fields: Option<Vec<String>>,
    pub rename_map: BTreeMap<String, String>,
}

pub fn normalize_rows(rows: Vec<Row>, params: &NormalizeParams) -> Result<Vec<Row>, CapabilityError> {
    let mut rows: Vec<Row> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(key, value)| match params.rename_map.get(&key) {
                    Some(renamed) => (renamed.clone(), value),
                    None => (key, value),
                })
                .collect()
        })
        .collect();

    if rows.is_empty() || params.method == NormalizeMethod::None {
        return Ok(rows);
    }

    let fields = match &params.fields {
        Some(fields) => fields.clone(),
        None => detect_numeric_fields(&rows),
    };

    for field in &fields {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(field).and_then(as_number))
            .collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let std_dev = if variance.sqrt() == 0.0 { 1.0 } else { variance.sqrt() };

        for row in rows.iter_mut() {
            let Some(v) = row.get(field).and_then(as_number) else {
                continue;
            };
            let scaled = match params.method {
                NormalizeMethod::Minmax if max != min => (v - min) / (max - min),
                NormalizeMethod::Minmax => 0.0,
                NormalizeMethod::Zscore => (v - mean) / std_dev,
                NormalizeMethod::None => v,
            };
            row.insert(field.clone(), number_value(round6(scaled)));
        }
    }
    Ok(rows)
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Fields of the first row whose non-null values are numeric in every row.
fn detect_numeric_fields(rows: &[Row]) -> Vec<String> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    first
        .keys()
        .filter(|key| {
            let mut seen = false;
            let all_numeric = rows.iter().all(|row| match row.get(key.as_str()) {
                None | Some(Value::Null) => true,
                Some(value) => {
                    seen = true;
                    as_number(value).is_some()
                }
            });
            all_numeric && seen
        })
        .cloned()
        .collect()
}

// ============================================================================
// compare
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompareParams {
    /// KPI targets keyed by field.
    pub targets: Map<String, Value>,
    /// Historical rows to average against.
    pub baseline: Vec<Row>,
    /// Fields compared to the baseline; every numeric field when absent.
    pub fields: Option<Vec<String>>,
}

pub fn compare_rows(rows: Vec<Row>, params: &CompareParams) -> Result<Vec<Row>, CapabilityError> {
    let baseline_refs: Vec<&Row> = params.baseline.iter().collect();

    let compared = rows
        .into_iter()
        .map(|row| {
            let mut enriched = row.clone();

            for (field, target) in &params.targets {
                let (Some(actual), Some(target)) = (row.get(field).and_then(as_number), as_number(target)) else {
                    continue;
                };
                let delta = actual - target;
                let status = if delta > 0.0 {
                    "above_target"
                } else if delta < 0.0 {
                    "below_target"
                } else {
                    "on_target"
                };
                enriched.insert(format!("{}_target", field), number_value(target));
                enriched.insert(format!("{}_delta", field), number_value(round4(delta)));
                enriched.insert(format!("{}_delta_pct", field), percent(delta, target));
                enriched.insert(format!("{}_status", field), Value::String(status.to_string()));
            }

            if !baseline_refs.is_empty() {
                let fields: Vec<String> = match &params.fields {
                    Some(fields) => fields.clone(),
                    None => row
                        .iter()
                        .filter(|(_, v)| as_number(v).is_some())
                        .map(|(k, _)| k.clone())
                        .collect(),
                };
                for field in fields {
                    let baseline_values = numeric_values(&baseline_refs, &field);
                    let Some(actual) = row.get(&field).and_then(as_number) else {
                        continue;
                    };
                    if baseline_values.is_empty() {
                        continue;
                    }
                    let avg = baseline_values.iter().sum::<f64>() / baseline_values.len() as f64;
                    enriched.insert(format!("{}_baseline_avg", field), number_value(round4(avg)));
                    enriched.insert(format!("{}_vs_baseline_pct", field), percent(actual - avg, avg));
                }
            }

            enriched
        })
        .collect();
    Ok(compared)
}

fn percent(delta: f64, reference: f64) -> Value {
    if reference == 0.0 {
        return Value::Null;
    }
    number_value(((delta / reference) * 100.0 * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .expect("array")
            .iter()
            .map(|v| v.as_object().cloned().expect("object"))
            .collect()
    }

    fn sales() -> Vec<Row> {
        rows(json!([
            {"region": "North", "revenue": 100, "date": "2024-01-15"},
            {"region": "south", "revenue": 50, "date": "2024-02-20"},
            {"region": "north", "revenue": "150", "date": "2024-03-05"},
        ]))
    }

    #[test]
    fn test_filter_conditions_are_case_insensitive() {
        let params: FilterParams = parse_params(
            json!({"conditions": {"region": "NORTH"}, "fields": ["revenue"]})
                .as_object()
                .cloned()
                .expect("object"),
        )
        .expect("params");
        let kept = filter_rows(sales(), &params).expect("filter");
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].keys().collect::<Vec<_>>(), vec!["revenue"]);
    }

    #[test]
    fn test_filter_date_range() {
        let params = FilterParams {
            date_field: Some("date".to_string()),
            date_from: Some("2024-02-01".to_string()),
            date_to: Some("2024-02-28".to_string()),
            ..Default::default()
        };
        let kept = filter_rows(sales(), &params).expect("filter");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["region"], "south");
    }

    #[test]
    fn test_filter_rejects_bad_bound() {
        let params = FilterParams {
            date_field: Some("date".to_string()),
            date_from: Some("last tuesday".to_string()),
            ..Default::default()
        };
        assert!(filter_rows(sales(), &params).is_err());
    }

    #[test]
    fn test_aggregate_grouped_and_sorted() {
        let params = AggregateParams {
            group_by: Some("region".to_string()),
            metrics: vec![MetricSpec {
                field: "revenue".to_string(),
                op: MetricOp::Sum,
            }],
            sort_by: Some("sum_revenue".to_string()),
            descending: true,
            top_n: Some(2),
        };
        let result = aggregate_rows(sales(), &params).expect("aggregate");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["region"], "north");
        assert_eq!(result[0]["sum_revenue"], 150.0);
        assert_eq!(result[1]["sum_revenue"], 100.0);
    }

    #[test]
    fn test_aggregate_without_group() {
        let params = AggregateParams {
            metrics: vec![
                MetricSpec {
                    field: "revenue".to_string(),
                    op: MetricOp::Avg,
                },
                MetricSpec {
                    field: "missing".to_string(),
                    op: MetricOp::Max,
                },
            ],
            ..Default::default()
        };
        let result = aggregate_rows(sales(), &params).expect("aggregate");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["_all"], true);
        assert_eq!(result[0]["avg_revenue"], 100.0);
        assert_eq!(result[0]["max_missing"], Value::Null);
    }

    #[test]
    fn test_normalize_minmax_and_rename() {
        let mut rename_map = BTreeMap::new();
        rename_map.insert("revenue".to_string(), "rev".to_string());
        let params = NormalizeParams {
            rename_map,
            ..Default::default()
        };
        let result = normalize_rows(sales(), &params).expect("normalize");
        assert_eq!(result[0]["rev"], 0.5);
        assert_eq!(result[1]["rev"], 0.0);
        assert_eq!(result[2]["rev"], 1.0);
        assert_eq!(result[0]["region"], "North");
    }

    #[test]
    fn test_normalize_zscore_constant_field() {
        let params = NormalizeParams {
            method: NormalizeMethod::Zscore,
            ..Default::default()
        };
        let result = normalize_rows(rows(json!([{"v": 5}, {"v": 5}])), &params).expect("normalize");
        assert_eq!(result[0]["v"], 0.0);
    }

    #[test]
    fn test_compare_targets_and_baseline() {
        let params = CompareParams {
            targets: json!({"revenue": 100}).as_object().cloned().expect("object"),
            baseline: rows(json!([{"revenue": 80}, {"revenue": 120}])),
            fields: Some(vec!["revenue".to_string()]),
        };
        let result = compare_rows(sales(), &params).expect("compare");
        assert_eq!(result[0]["revenue_status"], "on_target");
        assert_eq!(result[1]["revenue_status"], "below_target");
        assert_eq!(result[1]["revenue_delta_pct"], -50.0);
        assert_eq!(result[2]["revenue_vs_baseline_pct"], 50.0);
        assert_eq!(result[0]["revenue_baseline_avg"], 100.0);
    }

    #[test]
    fn test_percent_zero_reference() {
        assert_eq!(percent(5.0, 0.0), Value::Null);
    }

    #[tokio::test]
    async fn test_operation_returns_contract_shape() {
        let input = json!({
            "records": [{"a": 1}, {"b": 2}],
            "params": {},
        });
        let output = FilterOperation.invoke(input).await.expect("invoke");
        assert_eq!(output["columns"], json!(["a", "b"]));
        assert_eq!(output["rows"][0], json!({"a": 1, "b": null}));
    }

    #[tokio::test]
    async fn test_operation_rejects_malformed_params() {
        let input = json!({
            "records": [{"a": 1}],
            "params": {"method": "logarithmic"},
        });
        let err = NormalizeOperation.invoke(input).await.expect_err("bad method");
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }
}
