//! PowerPoint output: six slides in a minimal OOXML package.

use std::fmt::Write as _;
use std::io::{Cursor, Write as _};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::assembler::Report;
use super::charts::escape;
use super::render::{RenderedArtifact, Renderer, DEGRADED_NOTICE};
use crate::error::RenderError;

/// Maximum bullet lines per slide body.
const MAX_BULLETS: usize = 12;

pub struct PptxRenderer;

impl Renderer for PptxRenderer {
    fn format(&self) -> &'static str {
        "pptx"
    }

    fn render(&self, report: &Report, _charts: &[PathBuf], out_dir: &Path) -> Result<RenderedArtifact, RenderError> {
        let bytes = build_pptx(report)?;
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("{}.pptx", report.file_stem()));
        std::fs::write(&path, bytes)?;
        Ok(RenderedArtifact::File(path))
    }
}

/// Title and bullet lines of each slide.
pub fn slide_contents(report: &Report) -> Vec<(String, Vec<String>)> {
    let overview = &report.overview;
    let mut title_lines = vec![
        format!("Domain: {}", overview.domain),
        format!("Period: {}", overview.reporting_period),
        format!("Generated: {}", overview.generated_at.format("%Y-%m-%d %H:%M UTC")),
    ];
    if report.is_degraded() {
        title_lines.push(DEGRADED_NOTICE.to_string());
    }

    let mut overview_lines = vec![format!("KPIs: {}", overview.kpis.join(", "))];
    overview_lines.extend(overview.data_sources.iter().map(|s| format!("Source: {}", s)));

    let data_lines = match &report.data_summary.consolidated_dataset {
        Some(dataset) => {
            let mut lines = vec![format!("{} records consolidated", dataset.record_count)];
            let rollups = if dataset.kpi_rollups.is_empty() {
                &dataset.field_stats
            } else {
                &dataset.kpi_rollups
            };
            lines.extend(
                rollups
                    .iter()
                    .map(|(name, r)| format!("{}: avg {} (min {}, max {})", name, r.avg, r.min, r.max)),
            );
            lines
        }
        None => vec!["No consolidated data".to_string()],
    };

    let triz = &report.triz_analysis;
    let mut triz_lines = Vec::new();
    if !triz.ideal_final_result.is_empty() {
        triz_lines.push(format!("IFR: {}", triz.ideal_final_result));
    }
    triz_lines.extend(
        triz.contradictions
            .iter()
            .map(|c| format!("{} vs {}: {}", c.improving, c.degrading, c.description)),
    );
    triz_lines.extend(triz.principles.iter().map(|p| format!("#{} {}", p.number, p.name)));
    triz_lines.extend(triz.root_causes.iter().map(|c| format!("Root cause: {}", c)));

    let mut findings_lines: Vec<String> = report.key_findings.clone();
    findings_lines.extend(
        report
            .recommendations
            .iter()
            .map(|r| format!("[{}] {} ({}, {})", r.priority, r.action, r.owner, r.timeline)),
    );

    let mut confidence_lines = vec![format!("Confidence: {}%", report.confidence.percent)];
    if !report.confidence.rationale.is_empty() {
        confidence_lines.push(report.confidence.rationale.clone());
    }
    if report.confidence.degraded {
        confidence_lines.push(DEGRADED_NOTICE.to_string());
    }

    vec![
        (report.title.clone(), title_lines),
        ("Overview".to_string(), overview_lines),
        ("Data summary".to_string(), data_lines),
        ("TRIZ analysis".to_string(), triz_lines),
        ("Findings and recommendations".to_string(), findings_lines),
        ("Confidence".to_string(), confidence_lines),
    ]
}

/// Build the `.pptx` bytes.
pub fn build_pptx(report: &Report) -> Result<Vec<u8>, RenderError> {
    let slides = slide_contents(report);
    let mut package = Package::new();

    package.add("[Content_Types].xml", &content_types(slides.len()))?;
    package.add("_rels/.rels", ROOT_RELS)?;
    package.add("ppt/presentation.xml", &presentation_xml(slides.len()))?;
    package.add("ppt/_rels/presentation.xml.rels", &presentation_rels(slides.len()))?;
    package.add("ppt/slideMasters/slideMaster1.xml", SLIDE_MASTER)?;
    package.add("ppt/slideMasters/_rels/slideMaster1.xml.rels", SLIDE_MASTER_RELS)?;
    package.add("ppt/slideLayouts/slideLayout1.xml", SLIDE_LAYOUT)?;
    package.add("ppt/slideLayouts/_rels/slideLayout1.xml.rels", SLIDE_LAYOUT_RELS)?;
    package.add("ppt/theme/theme1.xml", THEME)?;

    for (i, (title, lines)) in slides.iter().enumerate() {
        let n = i + 1;
        package.add(&format!("ppt/slides/slide{}.xml", n), &slide_xml(title, lines))?;
        package.add(&format!("ppt/slides/_rels/slide{}.xml.rels", n), SLIDE_RELS)?;
    }
    package.finish()
}

fn slide_xml(title: &str, lines: &[String]) -> String {
    let mut body = String::new();
    let shown = lines.len().min(MAX_BULLETS);
    for line in &lines[..shown] {
        let _ = write!(body, "<a:p><a:r><a:rPr lang=\"en-US\" sz=\"1600\"/><a:t>{}</a:t></a:r></a:p>", escape(line));
    }
    if lines.len() > shown {
        let _ = write!(body, "<a:p><a:r><a:rPr lang=\"en-US\" sz=\"1600\"/><a:t>(+{} more)</a:t></a:r></a:p>", lines.len() - shown);
    }
    if body.is_empty() {
        body.push_str("<a:p><a:endParaRPr lang=\"en-US\"/></a:p>");
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:cSld><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr/><p:sp><p:nvSpPr><p:cNvPr id="2" name="Title"/><p:cNvSpPr txBox="1"/><p:nvPr/></p:nvSpPr><p:spPr><a:xfrm><a:off x="457200" y="274320"/><a:ext cx="8229600" cy="914400"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></p:spPr><p:txBody><a:bodyPr/><a:lstStyle/><a:p><a:r><a:rPr lang="en-US" sz="3200" b="1"/><a:t>{title}</a:t></a:r></a:p></p:txBody></p:sp><p:sp><p:nvSpPr><p:cNvPr id="3" name="Body"/><p:cNvSpPr txBox="1"/><p:nvPr/></p:nvSpPr><p:spPr><a:xfrm><a:off x="457200" y="1325880"/><a:ext cx="8229600" cy="4846320"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></p:spPr><p:txBody><a:bodyPr wrap="square"/><a:lstStyle/>{body}</p:txBody></p:sp></p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sld>"#,
        title = escape(title),
        body = body,
    )
}

fn content_types(slide_count: usize) -> String {
    let mut overrides = String::new();
    for n in 1..=slide_count {
        let _ = write!(
            overrides,
            r#"<Override PartName="/ppt/slides/slide{}.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slide+xml"/>"#,
            n
        );
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/ppt/presentation.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"/><Override PartName="/ppt/slideMasters/slideMaster1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideMaster+xml"/><Override PartName="/ppt/slideLayouts/slideLayout1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideLayout+xml"/><Override PartName="/ppt/theme/theme1.xml" ContentType="application/vnd.openxmlformats-officedocument.theme+xml"/>{}</Types>"#,
        overrides
    )
}

fn presentation_xml(slide_count: usize) -> String {
    let mut ids = String::new();
    for n in 1..=slide_count {
        let _ = write!(ids, r#"<p:sldId id="{}" r:id="rId{}"/>"#, 255 + n, n + 1);
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:presentation xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:sldMasterIdLst><p:sldMasterId id="2147483648" r:id="rId1"/></p:sldMasterIdLst><p:sldIdLst>{}</p:sldIdLst><p:sldSz cx="9144000" cy="6858000" type="screen4x3"/><p:notesSz cx="6858000" cy="9144000"/></p:presentation>"#,
        ids
    )
}

fn presentation_rels(slide_count: usize) -> String {
    let mut rels = String::from(
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideMaster" Target="slideMasters/slideMaster1.xml"/>"#,
    );
    for n in 1..=slide_count {
        let _ = write!(
            rels,
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide" Target="slides/slide{}.xml"/>"#,
            n + 1,
            n
        );
    }
    let _ = write!(
        rels,
        r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/theme" Target="theme/theme1.xml"/>"#,
        slide_count + 2
    );
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{}</Relationships>"#,
        rels
    )
}

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="ppt/presentation.xml"/></Relationships>"#;

const SLIDE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout" Target="../slideLayouts/slideLayout1.xml"/></Relationships>"#;

const SLIDE_MASTER_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout" Target="../slideLayouts/slideLayout1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/theme" Target="../theme/theme1.xml"/></Relationships>"#;

const SLIDE_LAYOUT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideMaster" Target="../slideMasters/slideMaster1.xml"/></Relationships>"#;

const SLIDE_MASTER: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:sldMaster xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:cSld><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr/></p:spTree></p:cSld><p:clrMap bg1="lt1" tx1="dk1" bg2="lt2" tx2="dk2" accent1="accent1" accent2="accent2" accent3="accent3" accent4="accent4" accent5="accent5" accent6="accent6" hlink="hlink" folHlink="folHlink"/><p:sldLayoutIdLst><p:sldLayoutId id="2147483649" r:id="rId1"/></p:sldLayoutIdLst></p:sldMaster>"#;

const SLIDE_LAYOUT: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:sldLayout xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" type="blank"><p:cSld name="Blank"><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr/></p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sldLayout>"#;

const THEME: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<a:theme xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" name="ARIA"><a:themeElements><a:clrScheme name="ARIA"><a:dk1><a:srgbClr val="000000"/></a:dk1><a:lt1><a:srgbClr val="FFFFFF"/></a:lt1><a:dk2><a:srgbClr val="1F3B57"/></a:dk2><a:lt2><a:srgbClr val="EEEEEE"/></a:lt2><a:accent1><a:srgbClr val="3B6EA5"/></a:accent1><a:accent2><a:srgbClr val="E0A100"/></a:accent2><a:accent3><a:srgbClr val="2E8B57"/></a:accent3><a:accent4><a:srgbClr val="C0392B"/></a:accent4><a:accent5><a:srgbClr val="7F8C8D"/></a:accent5><a:accent6><a:srgbClr val="8E44AD"/></a:accent6><a:hlink><a:srgbClr val="0563C1"/></a:hlink><a:folHlink><a:srgbClr val="954F72"/></a:folHlink></a:clrScheme><a:fontScheme name="ARIA"><a:majorFont><a:latin typeface="Calibri"/><a:ea typeface=""/><a:cs typeface=""/></a:majorFont><a:minorFont><a:latin typeface="Calibri"/><a:ea typeface=""/><a:cs typeface=""/></a:minorFont></a:fontScheme><a:fmtScheme name="ARIA"><a:fillStyleLst><a:solidFill><a:schemeClr val="phClr"/></a:solidFill><a:solidFill><a:schemeClr val="phClr"/></a:solidFill><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:fillStyleLst><a:lnStyleLst><a:ln w="6350"><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:ln><a:ln w="12700"><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:ln><a:ln w="19050"><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:ln></a:lnStyleLst><a:effectStyleLst><a:effectStyle><a:effectLst/></a:effectStyle><a:effectStyle><a:effectLst/></a:effectStyle><a:effectStyle><a:effectLst/></a:effectStyle></a:effectStyleLst><a:bgFillStyleLst><a:solidFill><a:schemeClr val="phClr"/></a:solidFill><a:solidFill><a:schemeClr val="phClr"/></a:solidFill><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:bgFillStyleLst></a:fmtScheme></a:themeElements></a:theme>"#;

// ============================================================================
// Zip container
// ============================================================================

/// In-memory OOXML package; every part is deflated.
struct Package {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl Package {
    fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    fn add(&mut self, name: &str, xml: &str) -> Result<(), RenderError> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer.start_file(name, options).map_err(package_error)?;
        self.writer.write_all(xml.as_bytes())?;
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, RenderError> {
        let cursor = self.writer.finish().map_err(package_error)?;
        Ok(cursor.into_inner())
    }
}

fn package_error(e: zip::result::ZipError) -> RenderError {
    RenderError::Encoding(format!("pptx package: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::render::tests::sample_report;
    use std::io::Read;
    use zip::ZipArchive;

    /// Read back (name, content) pairs in archive order.
    fn unzip(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("valid zip");
        (0..archive.len())
            .map(|i| {
                let mut part = archive.by_index(i).expect("part");
                assert_eq!(part.compression(), CompressionMethod::Deflated, "{}", part.name());
                let mut content = String::new();
                part.read_to_string(&mut content).expect("inflate");
                (part.name().to_string(), content)
            })
            .collect()
    }

    #[test]
    fn test_package_has_six_slides() {
        let bytes = build_pptx(&sample_report(false)).expect("build");
        let entries = unzip(&bytes);
        let slides: Vec<_> = entries
            .iter()
            .filter(|(name, _)| name.starts_with("ppt/slides/slide"))
            .collect();
        assert_eq!(slides.len(), 6);
        assert_eq!(entries[0].0, "[Content_Types].xml");
        assert!(entries.iter().any(|(name, _)| name == "ppt/presentation.xml"));
        // 9 package parts + 6 slides + 6 slide rels
        assert_eq!(entries.len(), 21);
    }

    #[test]
    fn test_degraded_note_and_escaping() {
        let bytes = build_pptx(&sample_report(true)).expect("build");
        let entries = unzip(&bytes);
        let all: String = entries.iter().map(|(_, c)| c.as_str()).collect();
        assert!(all.contains("DEGRADED REPORT"));
        assert!(all.contains("&lt;outperforms&gt;"));
    }

    #[test]
    fn test_renderer_writes_readable_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let artifact = PptxRenderer
            .render(&sample_report(false), &[], dir.path())
            .expect("render");
        let RenderedArtifact::File(path) = artifact else {
            panic!("pptx should render to a file");
        };
        let bytes = std::fs::read(&path).expect("read back");
        assert!(unzip(&bytes).iter().any(|(name, _)| name == "ppt/slides/slide6.xml"));
    }
}
