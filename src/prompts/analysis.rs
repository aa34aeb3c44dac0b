//! Prompt builders for the oracle-driven pipeline stages.

use crate::utils::truncate_chars;

/// Maximum characters of the consolidated dataset embedded in the TRIZ prompt.
pub const TRIZ_DATASET_PREVIEW_CHARS: usize = 5000;

/// Build the domain identification prompt from a JSON preview of the sources.
pub fn build_domain_prompt(source_preview: &str, user_instruction: Option<&str>) -> String {
    let instruction = user_instruction
        .map(|text| format!("\nUser instruction:\n{}\n", text))
        .unwrap_or_default();

    format!(
        r#"TASK: DOMAIN IDENTIFICATION

Reason first:
1. What do the columns and sample rows say about the domain?
2. Is the domain clear enough (confidence >= 0.6) to proceed, or should the user be asked?
3. Is the domain specific enough to need deeper research?

Source preview (columns + sample rows):
{source_preview}
{instruction}
Identify the domain, reporting period, KPIs and your confidence.

Respond ONLY with valid JSON:
{{
  "reasoning": "<step-by-step reasoning>",
  "domain": "<domain>",
  "reporting_period": "<period>",
  "kpis": ["kpi1", "kpi2"],
  "domain_confidence": 0.85,
  "needs_research_agent": false,
  "clarification_question": null
}}
"#
    )
}

/// Build the operation planning prompt.
///
/// `available_operations` lists registered operation capability names;
/// `sample_rows` is a short JSON sample of the extracted rows.
pub fn build_operation_plan_prompt(
    domain: &str,
    kpis: &[String],
    available_operations: &[String],
    sample_rows: &str,
) -> String {
    format!(
        r#"TASK: OPERATION PLANNING

Reason first:
1. Given domain "{domain}" and KPIs {kpis:?}, which operations are needed and in what order?
2. Are the available operations ({ops}) sufficient?

Sample rows:
{sample_rows}

If a required transformation is NOT covered by the available operations,
describe it under "missing_capability" instead of listing it in "operations".

Respond ONLY with valid JSON:
{{
  "reasoning": "<your reasoning>",
  "operations": [{{"op": "normalize", "params": {{}}}}],
  "missing_capability": null
}}

A missing capability, when needed, looks like:
{{"name": "snake_case_name", "description": "...", "input_shape": "...", "output_shape": "...", "example": "..."}}
"#,
        ops = available_operations.join(", "),
    )
}

/// Build the TRIZ analysis prompt.
pub fn build_triz_prompt(
    domain: &str,
    reporting_period: &str,
    kpis: &[String],
    consolidated_json: &str,
    iteration: u32,
) -> String {
    let dataset = truncate_chars(consolidated_json, TRIZ_DATASET_PREVIEW_CHARS);
    format!(
        r#"TASK: TRIZ ANALYSIS

Reason first:
1. Which contradictions are visible in this dataset?
2. What is the Ideal Final Result (IFR) for this domain?
3. Which TRIZ inventive principles apply to each contradiction?
4. What are the root causes (not symptoms)?

Domain: {domain} | Period: {reporting_period} | KPIs: {kpis:?} | Pass: {iteration}
Consolidated dataset (truncated):
{dataset}

Respond ONLY with valid JSON:
{{
  "reasoning": "<step-by-step reasoning>",
  "contradictions": [
    {{"type": "technical|physical", "improving_parameter": "", "degrading_parameter": "", "description": ""}}
  ],
  "ideal_final_result": "",
  "triz_principles_applied": [
    {{"principle_number": 1, "name": "Segmentation", "application": ""}}
  ],
  "root_causes": [],
  "cross_analysis": {{"time_vs_kpi": [], "department_vs_kpi": [], "insights": []}},
  "key_findings": [],
  "recommendations": [
    {{"action": "", "owner": "", "timeline": "", "priority": "High|Medium|Low"}}
  ],
  "confidence_score": 0.85,
  "confidence_rationale": ""
}}
"#
    )
}
