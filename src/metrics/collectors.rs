//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has run,
//! so library users and tests never need to initialize metrics.

use super::prometheus::{
    ACTIVE_RUNS, ORACLE_CALLS_TOTAL, ORACLE_LATENCY, REGISTERED_CAPABILITIES,
    RENDER_FAILURES_TOTAL, RUNS_TOTAL, RUN_DURATION, STAGE_DURATION, STAGE_VISITS_TOTAL,
    SYNTHESIS_REPAIRS, SYNTHESIS_TOTAL,
};

/// Metrics collector for recording pipeline metrics.
///
/// # Example
///
/// ```ignore
/// use aria_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage("data_extractor", 0.42);
/// collector.record_run("done", 12.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a run reaching a resting point (done, failed or waiting_for_human).
    pub fn record_run(&self, status: &str, duration_secs: f64) {
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[status]).inc();
        }
        if let Some(duration) = RUN_DURATION.get() {
            duration.observe(duration_secs);
        }
        tracing::trace!(status = status, duration_secs = duration_secs, "Recorded run metric");
    }

    /// Record one stage execution.
    pub fn record_stage(&self, stage: &str, duration_secs: f64) {
        if let Some(visits) = STAGE_VISITS_TOTAL.get() {
            visits.with_label_values(&[stage]).inc();
        }
        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }
    }

    /// Record an oracle call and its latency.
    pub fn record_oracle_call(&self, model: &str, outcome: &str, latency_secs: f64) {
        if let Some(calls) = ORACLE_CALLS_TOTAL.get() {
            calls.with_label_values(&[model, outcome]).inc();
        }
        if let Some(latency) = ORACLE_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }
    }

    /// Record the end of a capability synthesis run.
    pub fn record_synthesis(&self, outcome: &str, repair_attempts: u32) {
        if let Some(total) = SYNTHESIS_TOTAL.get() {
            total.with_label_values(&[outcome]).inc();
        }
        if let Some(repairs) = SYNTHESIS_REPAIRS.get() {
            repairs.observe(f64::from(repair_attempts));
        }
        tracing::trace!(outcome = outcome, repair_attempts = repair_attempts, "Recorded synthesis metric");
    }

    pub fn record_render_failure(&self, format: &str) {
        if let Some(failures) = RENDER_FAILURES_TOTAL.get() {
            failures.with_label_values(&[format]).inc();
        }
    }

    pub fn run_started(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.inc();
        }
    }

    pub fn run_stopped(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.dec();
        }
    }

    pub fn set_registered_capabilities(&self, count: usize) {
        if let Some(gauge) = REGISTERED_CAPABILITIES.get() {
            gauge.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_records_without_panicking() {
        let collector = MetricsCollector::new();
        // Before or after init, recording must never panic.
        collector.record_stage("triz_analyzer", 1.5);

        let _ = init_metrics();
        collector.record_stage("triz_analyzer", 1.5);
        collector.record_oracle_call("default", "ok", 0.8);
        collector.record_synthesis("success", 1);
        collector.record_render_failure("pdf");
        collector.run_started();
        collector.run_stopped();
        collector.set_registered_capabilities(8);

        let text = export_metrics();
        assert!(text.contains("aria_stage_visits_total"));
    }
}
