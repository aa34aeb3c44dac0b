//! Minimal text-only PDF writer.
//!
//! Produces a PDF 1.4 file with the Markdown rendering laid out as plain
//! Helvetica lines, 54 lines per page. Characters outside Latin-1 print as `?`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::assembler::Report;
use super::render::{markdown_document, RenderedArtifact, Renderer};
use crate::error::RenderError;

const LINES_PER_PAGE: usize = 54;
const WRAP_COLUMNS: usize = 95;
const FONT_SIZE: u32 = 10;
const LEADING: u32 = 13;

pub struct PdfRenderer;

impl Renderer for PdfRenderer {
    fn format(&self) -> &'static str {
        "pdf"
    }

    fn render(&self, report: &Report, _charts: &[PathBuf], out_dir: &Path) -> Result<RenderedArtifact, RenderError> {
        let lines = text_lines(&markdown_document(report));
        let bytes = write_pdf(&report.title, &lines);
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("{}.pdf", report.file_stem()));
        std::fs::write(&path, bytes)?;
        Ok(RenderedArtifact::File(path))
    }
}

/// Strip Markdown emphasis and wrap to the page width.
fn text_lines(markdown: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for raw in markdown.lines() {
        let line = raw.replace("**", "").replace('`', "");
        let line = line.trim_start_matches("> ");
        let line = match line.trim_start_matches('#') {
            stripped if stripped.len() != line.len() => stripped.trim_start().to_uppercase(),
            _ => line.to_string(),
        };
        if line.is_empty() {
            lines.push(String::new());
            continue;
        }
        lines.extend(wrap(&line, WRAP_COLUMNS));
    }
    lines
}

fn wrap(line: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split(' ') {
        let needed = current.chars().count() + word.chars().count() + usize::from(!current.is_empty());
        if needed > width && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        while current.chars().count() > width {
            let head: String = current.chars().take(width).collect();
            let tail: String = current.chars().skip(width).collect();
            out.push(head);
            current = tail;
        }
    }
    out.push(current);
    out
}

/// PDF string literal body with escapes; non-Latin-1 becomes `?`.
fn pdf_string(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            c if (c as u32) < 0x20 => out.push(b' '),
            c if (c as u32) <= 0xFF => out.push(c as u32 as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Assemble the PDF bytes: catalog, pages, font, one content stream per page.
pub fn write_pdf(title: &str, lines: &[String]) -> Vec<u8> {
    let pages: Vec<&[String]> = if lines.is_empty() {
        vec![lines]
    } else {
        lines.chunks(LINES_PER_PAGE).collect()
    };
    let page_count = pages.len();

    // object numbers: 1 catalog, 2 pages, 3 font, 4 info, then (page, content) pairs
    let first_page_obj = 5;
    let mut objects: Vec<Vec<u8>> = Vec::new();

    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    let kids: Vec<String> = (0..page_count)
        .map(|i| format!("{} 0 R", first_page_obj + 2 * i))
        .collect();
    objects.push(format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), page_count).into_bytes());
    objects.push(b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_vec());
    let mut info = b"<< /Producer (aria-forge) /Title (".to_vec();
    info.extend(pdf_string(title));
    info.extend(b") >>");
    objects.push(info);

    for (i, page_lines) in pages.iter().enumerate() {
        let content_obj = first_page_obj + 2 * i + 1;
        objects.push(
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                content_obj
            )
            .into_bytes(),
        );

        let mut stream = Vec::new();
        let mut header = String::new();
        let _ = write!(header, "BT /F1 {} Tf {} TL 50 750 Td ", FONT_SIZE, LEADING);
        stream.extend(header.into_bytes());
        for line in page_lines.iter() {
            stream.push(b'(');
            stream.extend(pdf_string(line));
            stream.extend(b") Tj T* ");
        }
        stream.extend(b"ET");

        let mut content = format!("<< /Length {} >>\nstream\n", stream.len()).into_bytes();
        content.extend(stream);
        content.extend(b"\nendstream");
        objects.push(content);
    }

    let mut out = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend(format!("{} 0 obj\n", i + 1).into_bytes());
        out.extend(body);
        out.extend(b"\nendobj\n");
    }

    let xref_offset = out.len();
    out.extend(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).into_bytes());
    for offset in offsets {
        out.extend(format!("{:010} 00000 n \n", offset).into_bytes());
    }
    out.extend(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R /Info 4 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        )
        .into_bytes(),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::render::tests::sample_report;

    #[test]
    fn test_pdf_structure() {
        let lines: Vec<String> = (0..120).map(|i| format!("line {} (x)", i)).collect();
        let bytes = write_pdf("Title", &lines);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.trim_end().ends_with("%%EOF"));
        assert!(text.contains("/Count 3"));
        assert!(text.contains("(line 0 \\(x\\)) Tj"));
    }

    #[test]
    fn test_xref_offsets_point_at_objects() {
        let bytes = write_pdf("T", &["hello".to_string()]);
        let xref = bytes
            .windows(5)
            .position(|w| w == b"xref\n")
            .expect("xref");
        let table = String::from_utf8_lossy(&bytes[xref..]).into_owned();
        let entries: Vec<usize> = table
            .lines()
            .skip(3)
            .take_while(|l| l.ends_with(" n "))
            .map(|l| l[..10].parse().expect("offset"))
            .collect();
        assert_eq!(entries.len(), 6);
        for (i, offset) in entries.iter().enumerate() {
            assert!(bytes[*offset..].starts_with(format!("{} 0 obj", i + 1).as_bytes()));
        }
    }

    #[test]
    fn test_wrap_long_lines() {
        let wrapped = wrap(&"word ".repeat(40), 20);
        assert!(wrapped.iter().all(|l| l.chars().count() <= 20));
        assert!(wrap(&"x".repeat(45), 20).len() == 3);
    }

    #[test]
    fn test_render_writes_file_with_degraded_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = PdfRenderer.render(&sample_report(true), &[], dir.path()).expect("render");
        let RenderedArtifact::File(path) = artifact else {
            panic!("pdf should be a file");
        };
        let bytes = std::fs::read(path).expect("read");
        assert!(String::from_utf8_lossy(&bytes).contains("DEGRADED REPORT"));
    }
}
