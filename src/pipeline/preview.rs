//! Short previews of the sources for domain identification.

use serde_json::{json, Value};

use super::state::{SourceDescriptor, SourceKind};
use crate::tools::extract::parse_csv;
use crate::utils::truncate_chars;

const PREVIEW_CHARS: usize = 500;
const PREVIEW_ROWS: usize = 3;

/// JSON array with one preview object per source.
///
/// Unreadable files get an `error` entry instead of failing the preview.
pub async fn build_source_preview(sources: &[SourceDescriptor]) -> String {
    let mut previews = Vec::with_capacity(sources.len());
    for source in sources {
        previews.push(preview_one(source).await);
    }
    serde_json::to_string_pretty(&Value::Array(previews)).unwrap_or_else(|_| "[]".to_string())
}

async fn preview_one(source: &SourceDescriptor) -> Value {
    if source.kind != SourceKind::File {
        return json!({
            "id": source.id,
            "kind": source.kind.to_string(),
            "location": source.location,
        });
    }

    let format = source.effective_format().unwrap_or_default();
    let text = match tokio::fs::read_to_string(&source.location).await {
        Ok(text) => text,
        Err(e) => {
            return json!({
                "id": source.id,
                "kind": "file",
                "format": format,
                "error": e.to_string(),
            });
        }
    };

    if format == "csv" {
        if let Ok((columns, rows)) = parse_csv(&text) {
            let sample: Vec<Value> = rows
                .into_iter()
                .take(PREVIEW_ROWS)
                .map(Value::Object)
                .collect();
            return json!({
                "id": source.id,
                "kind": "file",
                "format": format,
                "columns": columns,
                "sample_rows": sample,
            });
        }
    }

    json!({
        "id": source.id,
        "kind": "file",
        "format": format,
        "preview": truncate_chars(&text, PREVIEW_CHARS),
    })
}
