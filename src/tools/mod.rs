//! Built-in leaf capabilities.
//!
//! - [`extract`]: file, database, API and web extractors
//! - [`operations`]: filter, aggregate, normalize and compare
//! - [`knowledge`]: knowledge base lookups for the retrieval stage
//! - [`consolidation`]: the deterministic merge step
//! - [`rows`]: helpers for the rows/columns contract

pub mod consolidation;
pub mod extract;
pub mod knowledge;
pub mod operations;
pub mod rows;

pub use consolidation::{consolidate, fallback_dataset, ConsolidatedDataset, ConsolidationError, Rollup};
pub use extract::{
    effective_file_format, is_supported_file_format, ApiExtractor, DatabaseExtractor, FileExtractor,
    WebExtractor, SUPPORTED_FILE_FORMATS,
};
pub use knowledge::{KeywordKnowledgeBase, KnowledgeBase, KnowledgeBaseError, PlaceholderKnowledgeBase};
pub use operations::{
    AggregateOperation, CompareOperation, FilterOperation, NormalizeOperation, BUILTIN_OPERATIONS,
};

use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::CapabilityRegistry;

/// Register every built-in extractor and operation.
pub fn register_builtins(registry: &CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register_builtin(Arc::new(FileExtractor))?;
    registry.register_builtin(Arc::new(DatabaseExtractor))?;
    registry.register_builtin(Arc::new(ApiExtractor::default()))?;
    registry.register_builtin(Arc::new(WebExtractor::default()))?;

    registry.register_builtin(Arc::new(FilterOperation))?;
    registry.register_builtin(Arc::new(AggregateOperation))?;
    registry.register_builtin(Arc::new(NormalizeOperation))?;
    registry.register_builtin(Arc::new(CompareOperation))?;

    tracing::debug!(count = registry.len(), "Registered built-in capabilities");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityKind;

    #[test]
    fn test_register_builtins() {
        let registry = CapabilityRegistry::new();
        register_builtins(&registry).expect("register");

        assert_eq!(
            registry.names_of_kind(CapabilityKind::Extractor),
            vec![
                "extract_from_api",
                "extract_from_database",
                "extract_from_file",
                "extract_from_web"
            ]
        );
        for op in BUILTIN_OPERATIONS {
            assert!(registry.contains(op), "missing {}", op);
        }
    }
}
