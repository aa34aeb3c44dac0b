//! Routing policy of the stage graph.
//!
//! Every function here is pure: the next stage depends only on its arguments.

use super::state::{PipelineState, Stage};

/// Below this domain confidence the run asks a human.
pub const DOMAIN_AMBIGUITY_THRESHOLD: f64 = 0.30;

/// Logged by the domain stage only; does not affect routing.
pub const HUMAN_ESCALATION_THRESHOLD: f64 = 0.60;

/// Analysis confidence at which refinement stops.
pub const REFINEMENT_SUFFICIENCY_THRESHOLD: f64 = 0.70;

/// Shared cap of the refinement and error-retry loops.
pub const MAX_REFINEMENT_ITERATIONS: u32 = 3;

pub fn route_after_domain(needs_research: bool, domain_confidence: f64) -> Stage {
    if needs_research {
        Stage::ResearchAgent
    } else if domain_confidence < DOMAIN_AMBIGUITY_THRESHOLD {
        Stage::HumanCheckpoint
    } else {
        Stage::DataExtractor
    }
}

pub fn route_after_extraction(extracted_empty: bool, has_errors: bool) -> Stage {
    if extracted_empty && has_errors {
        Stage::ErrorHandler
    } else {
        Stage::DataOperator
    }
}

pub fn route_after_operator(needs_new_tool: bool, processed_empty: bool, has_errors: bool) -> Stage {
    if needs_new_tool {
        Stage::ToolBuilderAgent
    } else if processed_empty && has_errors {
        Stage::ErrorHandler
    } else {
        Stage::RagRetriever
    }
}

pub fn route_after_triz(confidence_score: f64, iteration: u32) -> Stage {
    if confidence_score >= REFINEMENT_SUFFICIENCY_THRESHOLD || iteration >= MAX_REFINEMENT_ITERATIONS {
        Stage::ReportGenerator
    } else {
        Stage::DataExtractor
    }
}

pub fn route_after_error(iteration: u32) -> Stage {
    if iteration < MAX_REFINEMENT_ITERATIONS {
        Stage::DataExtractor
    } else {
        Stage::ReportGenerator
    }
}

/// Whether a report produced at this point counts as degraded.
pub fn is_degraded_after_triz(confidence_score: f64, iteration: u32) -> bool {
    iteration >= MAX_REFINEMENT_ITERATIONS && confidence_score < REFINEMENT_SUFFICIENCY_THRESHOLD
}

/// An evaluated branch, ready to be logged as a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: String,
    pub rationale: String,
}

/// Result of routing out of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// `None` after the terminal stage.
    pub next: Option<Stage>,
    /// Set for conditional edges only.
    pub branch: Option<Branch>,
}

impl Route {
    fn fixed(next: Stage) -> Self {
        Self {
            next: Some(next),
            branch: None,
        }
    }

    fn conditional(next: Stage, condition: String, rationale: impl Into<String>) -> Self {
        Self {
            next: Some(next),
            branch: Some(Branch {
                condition,
                rationale: rationale.into(),
            }),
        }
    }
}

/// Decide where the run goes after `stage` has updated `state`.
pub fn next_stage(stage: Stage, state: &PipelineState) -> Route {
    match stage {
        Stage::DomainIdentifier => {
            let next = route_after_domain(state.needs_research, state.domain_confidence);
            let rationale = match next {
                Stage::ResearchAgent => "domain needs deeper research before extraction",
                Stage::HumanCheckpoint => "domain is ambiguous; a human must confirm it",
                _ => "domain is clear enough to extract",
            };
            Route::conditional(
                next,
                format!(
                    "needs_research={} domain_confidence={:.2} threshold={:.2}",
                    state.needs_research, state.domain_confidence, DOMAIN_AMBIGUITY_THRESHOLD
                ),
                rationale,
            )
        }
        Stage::HumanCheckpoint | Stage::ResearchAgent => Route::fixed(Stage::DataExtractor),
        Stage::DataExtractor => {
            let next = route_after_extraction(state.extracted_records.is_empty(), !state.errors.is_empty());
            let rationale = if next == Stage::ErrorHandler {
                "nothing was extracted and errors were recorded"
            } else {
                "records available for processing"
            };
            Route::conditional(
                next,
                format!(
                    "extracted_records={} errors={}",
                    state.extracted_records.len(),
                    state.errors.len()
                ),
                rationale,
            )
        }
        Stage::DataOperator => {
            let next = route_after_operator(
                state.needs_new_tool,
                state.processed_records.is_empty(),
                !state.errors.is_empty(),
            );
            let rationale = match next {
                Stage::ToolBuilderAgent => "a required capability is missing",
                Stage::ErrorHandler => "no rows were processed and errors were recorded",
                _ => "processed rows ready for retrieval",
            };
            Route::conditional(
                next,
                format!(
                    "needs_new_tool={} processed_records={} errors={}",
                    state.needs_new_tool,
                    state.processed_records.len(),
                    state.errors.len()
                ),
                rationale,
            )
        }
        Stage::ToolBuilderAgent => Route::fixed(Stage::RagRetriever),
        Stage::RagRetriever => Route::fixed(Stage::DataConsolidator),
        Stage::DataConsolidator => Route::fixed(Stage::TrizAnalyzer),
        Stage::TrizAnalyzer => {
            let next = route_after_triz(state.confidence_score, state.iteration);
            let rationale = if state.confidence_score >= REFINEMENT_SUFFICIENCY_THRESHOLD {
                "analysis confidence is sufficient"
            } else if next == Stage::ReportGenerator {
                "iteration cap reached; reporting with degraded confidence"
            } else {
                "confidence too low; refining with another extraction pass"
            };
            Route::conditional(
                next,
                format!(
                    "confidence_score={:.2} threshold={:.2} iteration={} max={}",
                    state.confidence_score,
                    REFINEMENT_SUFFICIENCY_THRESHOLD,
                    state.iteration,
                    MAX_REFINEMENT_ITERATIONS
                ),
                rationale,
            )
        }
        Stage::ErrorHandler => {
            let next = route_after_error(state.iteration);
            let rationale = if next == Stage::DataExtractor {
                "retrying extraction"
            } else {
                "iteration cap reached; giving up with a degraded report"
            };
            Route::conditional(
                next,
                format!("iteration={} max={}", state.iteration, MAX_REFINEMENT_ITERATIONS),
                rationale,
            )
        }
        Stage::ReportGenerator => Route {
            next: None,
            branch: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_domain_routing() {
        assert_eq!(route_after_domain(true, 0.1), Stage::ResearchAgent);
        assert_eq!(route_after_domain(false, 0.29), Stage::HumanCheckpoint);
        assert_eq!(route_after_domain(false, 0.30), Stage::DataExtractor);
        // 0.60 is logged only
        assert_eq!(route_after_domain(false, 0.45), Stage::DataExtractor);
    }

    #[test]
    fn test_extraction_routing() {
        assert_eq!(route_after_extraction(true, true), Stage::ErrorHandler);
        assert_eq!(route_after_extraction(true, false), Stage::DataOperator);
        assert_eq!(route_after_extraction(false, true), Stage::DataOperator);
    }

    #[test]
    fn test_operator_routing() {
        assert_eq!(route_after_operator(true, true, true), Stage::ToolBuilderAgent);
        assert_eq!(route_after_operator(false, true, true), Stage::ErrorHandler);
        assert_eq!(route_after_operator(false, true, false), Stage::RagRetriever);
        assert_eq!(route_after_operator(false, false, true), Stage::RagRetriever);
    }

    #[test]
    fn test_triz_routing() {
        assert_eq!(route_after_triz(0.9, 1), Stage::ReportGenerator);
        assert_eq!(route_after_triz(0.70, 1), Stage::ReportGenerator);
        assert_eq!(route_after_triz(0.5, 2), Stage::DataExtractor);
        assert_eq!(route_after_triz(0.4, 3), Stage::ReportGenerator);
        assert!(is_degraded_after_triz(0.4, 3));
        assert!(!is_degraded_after_triz(0.8, 3));
        assert!(!is_degraded_after_triz(0.4, 2));
    }

    #[test]
    fn test_error_routing() {
        assert_eq!(route_after_error(1), Stage::DataExtractor);
        assert_eq!(route_after_error(2), Stage::DataExtractor);
        assert_eq!(route_after_error(3), Stage::ReportGenerator);
    }

    #[test]
    fn test_next_stage_is_pure() {
        let mut state = PipelineState::new("t", Vec::new(), BTreeSet::new(), None);
        state.set_domain_confidence(0.1);
        let first = next_stage(Stage::DomainIdentifier, &state);
        let second = next_stage(Stage::DomainIdentifier, &state);
        assert_eq!(first, second);
        assert_eq!(first.next, Some(Stage::HumanCheckpoint));
        assert!(first.branch.is_some());
    }

    #[test]
    fn test_fixed_edges_have_no_branch() {
        let state = PipelineState::new("t", Vec::new(), BTreeSet::new(), None);
        for stage in [Stage::ResearchAgent, Stage::RagRetriever, Stage::ToolBuilderAgent] {
            assert!(next_stage(stage, &state).branch.is_none());
        }
        assert_eq!(next_stage(Stage::ReportGenerator, &state).next, None);
    }
}
