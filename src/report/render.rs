//! Output renderers.
//!
//! Each format is a [`Renderer`]; the report stage looks renderers up by
//! format name and records a failure per format without stopping the others.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tera::{Context, Tera};

use super::assembler::Report;
use super::pdf::PdfRenderer;
use super::pptx::PptxRenderer;
use crate::error::RenderError;
use crate::tools::rows::display_value;

/// What a renderer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum RenderedArtifact {
    File(PathBuf),
    Inline(String),
}

pub trait Renderer: Send + Sync {
    /// Format name used in run requests, e.g. `"html"`.
    fn format(&self) -> &'static str;

    fn render(&self, report: &Report, charts: &[PathBuf], out_dir: &Path) -> Result<RenderedArtifact, RenderError>;
}

/// Every built-in renderer keyed by format.
pub fn default_renderers() -> BTreeMap<String, Arc<dyn Renderer>> {
    let renderers: [Arc<dyn Renderer>; 5] = [
        Arc::new(JsonRenderer),
        Arc::new(MarkdownRenderer),
        Arc::new(HtmlRenderer),
        Arc::new(PdfRenderer),
        Arc::new(PptxRenderer),
    ];
    renderers
        .into_iter()
        .map(|r| (r.format().to_string(), r))
        .collect()
}

pub const DEGRADED_NOTICE: &str = "DEGRADED REPORT: analysis confidence stayed below 70% after the maximum number of refinement passes. Treat findings as provisional.";

// ============================================================================
// JSON
// ============================================================================

pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn render(&self, report: &Report, _charts: &[PathBuf], _out_dir: &Path) -> Result<RenderedArtifact, RenderError> {
        Ok(RenderedArtifact::Inline(serde_json::to_string_pretty(report)?))
    }
}

// ============================================================================
// Markdown
// ============================================================================

pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn format(&self) -> &'static str {
        "markdown"
    }

    fn render(&self, report: &Report, _charts: &[PathBuf], _out_dir: &Path) -> Result<RenderedArtifact, RenderError> {
        Ok(RenderedArtifact::Inline(markdown_document(report)))
    }
}

/// The report as Markdown; also the text source for the PDF writer.
pub fn markdown_document(report: &Report) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# {}\n", report.title);
    if report.is_degraded() {
        let _ = writeln!(md, "> **{}**\n", DEGRADED_NOTICE);
    }

    let overview = &report.overview;
    let _ = writeln!(md, "## 1. Overview\n");
    let _ = writeln!(md, "- **Domain:** {}", overview.domain);
    let _ = writeln!(md, "- **Reporting period:** {}", or_dash(&overview.reporting_period));
    let _ = writeln!(md, "- **KPIs:** {}", or_dash(&overview.kpis.join(", ")));
    let _ = writeln!(md, "- **Generated:** {}", overview.generated_at.to_rfc3339());
    let _ = writeln!(md, "- **Data sources:**");
    for source in &overview.data_sources {
        let _ = writeln!(md, "  - {}", source);
    }
    md.push('\n');

    let _ = writeln!(md, "## 2. Data summary\n");
    match &report.data_summary.consolidated_dataset {
        Some(dataset) => {
            let _ = writeln!(md, "Records: {}", dataset.record_count);
            if dataset.fallback {
                let _ = writeln!(md, "\n_Consolidation fell back to the unprocessed rows._");
            }
            if !dataset.field_stats.is_empty() {
                let _ = writeln!(md, "\n| Field | Count | Sum | Avg | Min | Max |");
                let _ = writeln!(md, "|---|---|---|---|---|---|");
                for (field, r) in &dataset.field_stats {
                    let _ = writeln!(
                        md,
                        "| {} | {} | {} | {} | {} | {} |",
                        field, r.count, r.sum, r.avg, r.min, r.max
                    );
                }
            }
            if !dataset.kpi_rollups.is_empty() {
                let _ = writeln!(md, "\nKPI rollups:\n");
                for (kpi, r) in &dataset.kpi_rollups {
                    let _ = writeln!(md, "- {}: avg {} (min {}, max {}, n={})", kpi, r.avg, r.min, r.max, r.count);
                }
            }
        }
        None => {
            let _ = writeln!(md, "No consolidated data.");
        }
    }
    let _ = writeln!(md, "\nKnowledge chunks used: {}\n", report.data_summary.rag_chunks_used);

    let triz = &report.triz_analysis;
    let _ = writeln!(md, "## 3. TRIZ analysis\n");
    if triz.is_empty() {
        let _ = writeln!(md, "No analysis available.\n");
    } else {
        if !triz.ideal_final_result.is_empty() {
            let _ = writeln!(md, "**Ideal final result:** {}\n", triz.ideal_final_result);
        }
        if !triz.contradictions.is_empty() {
            let _ = writeln!(md, "### Contradictions\n");
            for c in &triz.contradictions {
                let _ = writeln!(
                    md,
                    "- **{:?}**: improving _{}_ degrades _{}_. {}",
                    c.kind, c.improving, c.degrading, c.description
                );
            }
            md.push('\n');
        }
        if !triz.principles.is_empty() {
            let _ = writeln!(md, "### Principles applied\n");
            for p in &triz.principles {
                let _ = writeln!(md, "- #{} {}: {}", p.number, p.name, p.application);
            }
            md.push('\n');
        }
        if !triz.root_causes.is_empty() {
            let _ = writeln!(md, "### Root causes\n");
            for cause in &triz.root_causes {
                let _ = writeln!(md, "- {}", cause);
            }
            md.push('\n');
        }
        if !triz.cross_analysis.is_null() {
            let _ = writeln!(md, "### Cross analysis\n\n{}\n", display_value(&triz.cross_analysis));
        }
    }

    let _ = writeln!(md, "## 4. Key findings\n");
    if report.key_findings.is_empty() {
        let _ = writeln!(md, "None recorded.");
    }
    for (i, finding) in report.key_findings.iter().enumerate() {
        let _ = writeln!(md, "{}. {}", i + 1, finding);
    }
    md.push('\n');

    let _ = writeln!(md, "## 5. Recommendations\n");
    if report.recommendations.is_empty() {
        let _ = writeln!(md, "None recorded.\n");
    } else {
        let _ = writeln!(md, "| Priority | Action | Owner | Timeline |");
        let _ = writeln!(md, "|---|---|---|---|");
        for r in &report.recommendations {
            let _ = writeln!(md, "| {} | {} | {} | {} |", r.priority, r.action, r.owner, r.timeline);
        }
        md.push('\n');
    }

    let confidence = &report.confidence;
    let _ = writeln!(md, "## 6. Confidence\n");
    let _ = writeln!(
        md,
        "**{}%**{}",
        confidence.percent,
        if confidence.degraded { " (degraded)" } else { "" }
    );
    if !confidence.rationale.is_empty() {
        let _ = writeln!(md, "\n{}", confidence.rationale);
    }
    md
}

fn or_dash(text: &str) -> &str {
    if text.is_empty() {
        "-"
    } else {
        text
    }
}

// ============================================================================
// HTML
// ============================================================================

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{ title }}</title>
<style>
body { font-family: Helvetica, Arial, sans-serif; max-width: 960px; margin: 2em auto; color: #222; }
.degraded { background: #fff3cd; border: 1px solid #e0a100; padding: 0.8em; }
table { border-collapse: collapse; } td, th { border: 1px solid #ccc; padding: 4px 8px; }
.charts img { margin: 0.5em; }
</style>
</head>
<body>
<h1>{{ title }}</h1>
{% if degraded %}<p class="degraded"><strong>{{ degraded_notice }}</strong></p>{% endif %}
<section>
<h2>1. Overview</h2>
<ul>
<li><strong>Domain:</strong> {{ overview.domain }}</li>
<li><strong>Reporting period:</strong> {{ overview.reporting_period }}</li>
<li><strong>KPIs:</strong> {{ overview.kpis | join(sep=", ") }}</li>
<li><strong>Generated:</strong> {{ overview.generated_at }}</li>
</ul>
<ul>{% for source in overview.data_sources %}<li>{{ source }}</li>{% endfor %}</ul>
</section>
<section class="charts">
{% for chart in charts %}<img alt="{{ chart.name }}" src="{{ chart.data_uri | safe }}">{% endfor %}
</section>
<section>
<h2>2. Data summary</h2>
{% if dataset %}
<p>Records: {{ dataset.record_count }}{% if dataset.fallback %} (fallback){% endif %}</p>
<table>
<tr><th>Field</th><th>Count</th><th>Sum</th><th>Avg</th><th>Min</th><th>Max</th></tr>
{% for field, r in dataset.field_stats %}<tr><td>{{ field }}</td><td>{{ r.count }}</td><td>{{ r.sum }}</td><td>{{ r.avg }}</td><td>{{ r.min }}</td><td>{{ r.max }}</td></tr>
{% endfor %}</table>
{% else %}<p>No consolidated data.</p>{% endif %}
<p>Knowledge chunks used: {{ rag_chunks_used }}</p>
</section>
<section>
<h2>3. TRIZ analysis</h2>
{% if triz.ideal_final_result %}<p><strong>Ideal final result:</strong> {{ triz.ideal_final_result }}</p>{% endif %}
<ul>{% for c in triz.contradictions %}<li><strong>{{ c.kind }}</strong>: improving {{ c.improving }} degrades {{ c.degrading }}. {{ c.description }}</li>{% endfor %}</ul>
<ul>{% for p in triz.principles %}<li>#{{ p.number }} {{ p.name }}: {{ p.application }}</li>{% endfor %}</ul>
<ul>{% for cause in triz.root_causes %}<li>{{ cause }}</li>{% endfor %}</ul>
</section>
<section>
<h2>4. Key findings</h2>
<ol>{% for finding in key_findings %}<li>{{ finding }}</li>{% endfor %}</ol>
</section>
<section>
<h2>5. Recommendations</h2>
<table>
<tr><th>Priority</th><th>Action</th><th>Owner</th><th>Timeline</th></tr>
{% for r in recommendations %}<tr><td>{{ r.priority }}</td><td>{{ r.action }}</td><td>{{ r.owner }}</td><td>{{ r.timeline }}</td></tr>
{% endfor %}</table>
</section>
<section>
<h2>6. Confidence</h2>
<p><strong>{{ confidence.percent }}%</strong>{% if confidence.degraded %} (degraded){% endif %}</p>
<p>{{ confidence.rationale }}</p>
</section>
</body>
</html>
"#;

#[derive(Serialize)]
struct EmbeddedChart {
    name: String,
    data_uri: String,
}

pub struct HtmlRenderer;

impl HtmlRenderer {
    /// Render the HTML text without writing it.
    pub fn render_html(&self, report: &Report, charts: &[PathBuf]) -> Result<String, RenderError> {
        let mut embedded = Vec::with_capacity(charts.len());
        for path in charts {
            let svg = std::fs::read(path)?;
            embedded.push(EmbeddedChart {
                name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                data_uri: format!("data:image/svg+xml;base64,{}", BASE64.encode(svg)),
            });
        }

        let mut context = Context::new();
        context.insert("title", &report.title);
        context.insert("degraded", &report.is_degraded());
        context.insert("degraded_notice", DEGRADED_NOTICE);
        context.insert("overview", &report.overview);
        context.insert("dataset", &report.data_summary.consolidated_dataset);
        context.insert("rag_chunks_used", &report.data_summary.rag_chunks_used);
        context.insert("triz", &report.triz_analysis);
        context.insert("key_findings", &report.key_findings);
        context.insert("recommendations", &report.recommendations);
        context.insert("confidence", &report.confidence);
        context.insert("charts", &embedded);

        Ok(Tera::one_off(HTML_TEMPLATE, &context, true)?)
    }
}

impl Renderer for HtmlRenderer {
    fn format(&self) -> &'static str {
        "html"
    }

    fn render(&self, report: &Report, charts: &[PathBuf], out_dir: &Path) -> Result<RenderedArtifact, RenderError> {
        let html = self.render_html(report, charts)?;
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("{}.html", report.file_stem()));
        std::fs::write(&path, html)?;
        Ok(RenderedArtifact::File(path))
    }
}
