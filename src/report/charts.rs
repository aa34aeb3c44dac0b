//! SVG charts embedded in the rendered reports.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::assembler::Report;
use crate::error::RenderError;
use crate::pipeline::state::ContradictionKind;

const WIDTH: f64 = 640.0;
const BAR_HEIGHT: f64 = 28.0;
const LABEL_WIDTH: f64 = 200.0;

/// Write the three report charts under `out_dir` and return their paths.
pub fn render_charts(report: &Report, out_dir: &Path) -> Result<Vec<PathBuf>, RenderError> {
    std::fs::create_dir_all(out_dir)?;
    let stem = report.file_stem();

    let technical = report
        .triz_analysis
        .contradictions
        .iter()
        .filter(|c| c.kind == ContradictionKind::Technical)
        .count();
    let physical = report.triz_analysis.contradictions.len() - technical;

    let charts = [
        ("kpi_averages", bar_chart_svg("KPI averages", &report.chart_series())),
        ("confidence", gauge_svg(report.confidence.score, report.confidence.degraded)),
        (
            "contradictions",
            bar_chart_svg(
                "Contradictions",
                &[
                    ("technical".to_string(), technical as f64),
                    ("physical".to_string(), physical as f64),
                ],
            ),
        ),
    ];

    let mut paths = Vec::with_capacity(charts.len());
    for (name, svg) in charts {
        let path = out_dir.join(format!("{}_{}.svg", stem, name));
        std::fs::write(&path, svg)?;
        paths.push(path);
    }
    Ok(paths)
}

/// Horizontal bar chart. Negative values are drawn as zero-length bars.
pub fn bar_chart_svg(title: &str, series: &[(String, f64)]) -> String {
    let height = 48.0 + BAR_HEIGHT * series.len().max(1) as f64;
    let max = series
        .iter()
        .map(|(_, v)| *v)
        .filter(|v| v.is_finite())
        .fold(0.0_f64, f64::max);
    let plot_width = WIDTH - LABEL_WIDTH - 80.0;

    let mut svg = header(height);
    let _ = writeln!(
        svg,
        r#"<text x="10" y="24" font-size="16" font-weight="bold">{}</text>"#,
        escape(title)
    );
    if series.is_empty() {
        let _ = writeln!(svg, r#"<text x="10" y="56" font-size="12">no data</text>"#);
    }
    for (i, (label, value)) in series.iter().enumerate() {
        let y = 40.0 + BAR_HEIGHT * i as f64;
        let value = if value.is_finite() { *value } else { 0.0 };
        let width = if max > 0.0 { (value.max(0.0) / max) * plot_width } else { 0.0 };
        let _ = writeln!(
            svg,
            r##"<text x="10" y="{ty:.1}" font-size="12">{label}</text><rect x="{x}" y="{y:.1}" width="{width:.1}" height="{h:.1}" fill="#3b6ea5"/><text x="{vx:.1}" y="{ty:.1}" font-size="12">{value}</text>"##,
            ty = y + BAR_HEIGHT * 0.65,
            label = escape(label),
            x = LABEL_WIDTH,
            y = y + 4.0,
            width = width,
            h = BAR_HEIGHT - 8.0,
            vx = LABEL_WIDTH + width + 6.0,
            value = format_value(value),
        );
    }
    svg.push_str("</svg>\n");
    svg
}

/// Semicircle gauge for a score in `[0, 1]`.
pub fn gauge_svg(score: f64, degraded: bool) -> String {
    let score = crate::pipeline::state::clamp_unit(score);
    let (cx, cy, r) = (160.0_f64, 150.0_f64, 110.0_f64);
    let angle = std::f64::consts::PI * (1.0 - score);
    let (ex, ey) = (cx + r * angle.cos(), cy - r * angle.sin());
    let color = if score >= 0.7 {
        "#2e8b57"
    } else if score >= 0.3 {
        "#e0a100"
    } else {
        "#c0392b"
    };

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="320" height="190" viewBox="0 0 320 190">"#
    );
    let _ = writeln!(
        svg,
        r##"<path d="M {x0} {cy} A {r} {r} 0 0 1 {x1} {cy}" fill="none" stroke="#dddddd" stroke-width="22"/>"##,
        x0 = cx - r,
        x1 = cx + r,
    );
    if score > 0.0 {
        let _ = writeln!(
            svg,
            r#"<path d="M {x0} {cy} A {r} {r} 0 0 1 {ex:.2} {ey:.2}" fill="none" stroke="{color}" stroke-width="22"/>"#,
            x0 = cx - r,
        );
    }
    let _ = writeln!(
        svg,
        r#"<text x="{cx}" y="{ty}" font-size="28" text-anchor="middle">{pct}%</text>"#,
        ty = cy - 10.0,
        pct = (score * 100.0).round() as u32,
    );
    let label = if degraded { "confidence (degraded)" } else { "confidence" };
    let _ = writeln!(
        svg,
        r#"<text x="{cx}" y="{ty}" font-size="13" text-anchor="middle">{label}</text>"#,
        ty = cy + 24.0,
    );
    svg.push_str("</svg>\n");
    svg
}

fn header(height: f64) -> String {
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n",
        w = WIDTH,
        h = height
    )
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

/// Escape text for SVG, HTML and XML bodies.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
