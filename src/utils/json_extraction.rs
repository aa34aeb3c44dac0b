//! JSON extraction utilities for parsing LLM responses.
//!
//! Oracle replies routinely wrap the requested object in markdown fences or
//! surround it with prose. Strategies, tried in order:
//! 1. The whole (trimmed) content parses as JSON
//! 2. The body of a fenced ```json block
//! 3. The body of any fenced block
//! 4. The first balanced `{...}` or `[...]` span found by bracket matching
//!
//! # Example
//!
//! ```
//! use aria_forge::utils::json_extraction::extract_json_value;
//!
//! let response = "Sure! ```json\n{\"domain\": \"logistics\"}\n```";
//! let value = extract_json_value(response).unwrap();
//! assert_eq!(value["domain"], "logistics");
//! ```

use serde_json::Value;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed} unclosed delimiters. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

const PREVIEW_CHARS: usize = 80;

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Extract the first JSON value from an LLM response.
pub fn extract_json_value(content: &str) -> Result<Value, JsonExtractionError> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    for block in fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(value);
        }
    }

    let mut search_from = 0;
    while let Some(offset) = trimmed[search_from..].find(&['{', '['][..]) {
        let start = search_from + offset;
        match balanced_span_end(&trimmed[start..]) {
            Some(end) => {
                let candidate = &trimmed[start..start + end];
                if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                    return Ok(value);
                }
                search_from = start + 1;
            }
            None => {
                let unclosed = unclosed_delimiters(&trimmed[start..]);
                return Err(JsonExtractionError::Truncated {
                    partial_preview: preview(&trimmed[start..]),
                    unclosed,
                });
            }
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed),
    })
}

/// Extract the first JSON object (not array) from an LLM response.
pub fn extract_json_object(
    content: &str,
) -> Result<serde_json::Map<String, Value>, JsonExtractionError> {
    match extract_json_value(content)? {
        Value::Object(map) => Ok(map),
        _ => Err(JsonExtractionError::NotFound {
            content_preview: preview(content.trim()),
        }),
    }
}

/// Strip a surrounding markdown fence, returning the inner text.
///
/// Text without a fence is returned trimmed and otherwise unchanged.
pub fn strip_code_fence(content: &str) -> &str {
    fenced_blocks(content)
        .into_iter()
        .next()
        .map(str::trim)
        .unwrap_or_else(|| content.trim())
}

/// Bodies of fenced blocks, ```json blocks first.
fn fenced_blocks(content: &str) -> Vec<&str> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    let mut rest = content;

    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let tag = after_fence[..newline].trim().to_lowercase();
        let body_start = &after_fence[newline + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        let body = &body_start[..close];
        if tag == "json" {
            tagged.push(body);
        } else {
            untagged.push(body);
        }
        rest = &body_start[close + 3..];
    }

    tagged.extend(untagged);
    tagged
}

/// Byte length of the balanced span starting at `s[0]`, string-literal aware.
fn balanced_span_end(s: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in s.char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn unclosed_delimiters(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escaped = false;
    for ch in s.chars() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_json() {
        let value = extract_json_value(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_fenced_json_preferred_over_other_blocks() {
        let content = "```text\nnot json\n```\nthen\n```json\n{\"ok\": true}\n```";
        let value = extract_json_value(content).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_embedded_object_with_braces_in_strings() {
        let content = r#"Here you go: {"code": "def f():\n    return {'rows': []}", "n": 2} hope it helps"#;
        let value = extract_json_value(content).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn test_truncated_object() {
        let err = extract_json_value(r#"result: {"domain": "retail", "kpis": ["a""#).unwrap_err();
        assert!(matches!(err, JsonExtractionError::Truncated { unclosed: 2, .. }));
    }

    #[test]
    fn test_not_found() {
        let err = extract_json_value("I cannot help with that.").unwrap_err();
        assert!(matches!(err, JsonExtractionError::NotFound { .. }));
    }

    #[test]
    fn test_extract_object_rejects_array() {
        assert!(extract_json_object("[1, 2]").is_err());
        assert!(extract_json_object(r#"{"x": []}"#).is_ok());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```python\nprint(1)\n```"), "print(1)");
        assert_eq!(strip_code_fence("  plain  "), "plain");
    }
}
