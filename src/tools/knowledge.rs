//! Knowledge base lookups for the retrieval stage.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors raised by knowledge base queries.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("Knowledge base directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Knowledge base query failed: {0}")]
    QueryFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A source of context chunks for a natural-language query.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<String>, KnowledgeBaseError>;
}

/// Stand-in used when no knowledge base is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderKnowledgeBase;

#[async_trait]
impl KnowledgeBase for PlaceholderKnowledgeBase {
    async fn query(&self, text: &str, _top_k: usize) -> Result<Vec<String>, KnowledgeBaseError> {
        Ok(vec![format!(
            "[KB PLACEHOLDER] No knowledge base configured. Query: '{}'",
            crate::utils::truncate_chars(text, 80)
        )])
    }
}

#[derive(Debug, Clone)]
struct Chunk {
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// In-memory term-overlap index over `.md` and `.txt` documents.
///
/// Documents are split into paragraph chunks; a query scores each chunk by
/// the number of distinct query terms it contains.
#[derive(Debug, Clone, Default)]
pub struct KeywordKnowledgeBase {
    chunks: Vec<Chunk>,
}

impl KeywordKnowledgeBase {
    /// Index every `.md`/`.txt` file under `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, KnowledgeBaseError> {
        if !dir.is_dir() {
            return Err(KnowledgeBaseError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut kb = Self::default();
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_document = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("md") | Some("txt")
            );
            if !is_document {
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let source = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .display()
                .to_string();
            kb.add_document(&source, &content);
        }

        tracing::info!(dir = %dir.display(), chunks = kb.chunks.len(), "Loaded knowledge base");
        Ok(kb)
    }

    /// Add one document, split on blank lines.
    pub fn add_document(&mut self, source: &str, content: &str) {
        for paragraph in content.split("\n\n") {
            let text = paragraph.trim();
            if text.is_empty() {
                continue;
            }
            self.chunks.push(Chunk {
                source: source.to_string(),
                text: text.to_string(),
                terms: terms(text),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn search(&self, text: &str, top_k: usize) -> Vec<String> {
        let query_terms = terms(text);
        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (chunk.terms.intersection(&query_terms).count(), i))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Highest score first, ties in document order.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(top_k)
            .map(|(_, i)| format!("[{}] {}", self.chunks[i].source, self.chunks[i].text))
            .collect()
    }
}

#[async_trait]
impl KnowledgeBase for KeywordKnowledgeBase {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<String>, KnowledgeBaseError> {
        Ok(self.search(text, top_k))
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}
