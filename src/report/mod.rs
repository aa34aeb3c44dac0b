//! Report assembly and rendering.
//!
//! - [`assembler`]: folds the final state into the six-section [`Report`]
//! - [`charts`]: SVG charts written next to the rendered files
//! - [`render`]: the [`Renderer`] trait with JSON, Markdown and HTML output
//! - [`pdf`], [`pptx`]: binary document writers

pub mod assembler;
pub mod charts;
pub mod pdf;
pub mod pptx;
pub mod render;

pub use assembler::{assemble_report, ConfidenceSection, DataSummary, Overview, Report};
pub use charts::render_charts;
pub use pdf::PdfRenderer;
pub use pptx::PptxRenderer;
pub use render::{
    default_renderers, markdown_document, HtmlRenderer, JsonRenderer, MarkdownRenderer, RenderedArtifact,
    Renderer, DEGRADED_NOTICE,
};
