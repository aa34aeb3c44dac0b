//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks pipeline runs, stage executions, oracle calls, capability synthesis
//! and renderer failures.
//!
//! ```ignore
//! use aria_forge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_RUNS, ORACLE_CALLS_TOTAL, ORACLE_LATENCY, REGISTERED_CAPABILITIES, REGISTRY,
    RENDER_FAILURES_TOTAL, RUNS_TOTAL, RUN_DURATION, STAGE_DURATION, STAGE_VISITS_TOTAL,
    SYNTHESIS_REPAIRS, SYNTHESIS_TOTAL,
};
