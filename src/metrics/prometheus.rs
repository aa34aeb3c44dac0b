//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by aria-forge and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all aria-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total pipeline runs that reached a resting point, labeled by status
/// (done, failed, waiting_for_human).
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock time from run start (or resume) to its resting point.
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Stage executions, labeled by stage name.
pub static STAGE_VISITS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage name.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Oracle calls, labeled by model and outcome (ok, error, timeout, empty).
pub static ORACLE_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Oracle call latency in seconds, labeled by model.
pub static ORACLE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Capability synthesis runs, labeled by outcome (success, failed, reused).
pub static SYNTHESIS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Repair attempts consumed per synthesis run.
pub static SYNTHESIS_REPAIRS: OnceLock<Histogram> = OnceLock::new();

/// Renderer failures, labeled by output format.
pub static RENDER_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs currently executing stages.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Capabilities currently present in the registry.
pub static REGISTERED_CAPABILITIES: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first set of
/// metrics stays installed.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("aria_runs_total", "Pipeline runs that reached a resting point"),
        &["status"],
    )?;

    let run_duration = Histogram::with_opts(
        HistogramOpts::new("aria_run_duration_seconds", "Pipeline run duration in seconds")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
    )?;

    let stage_visits_total = CounterVec::new(
        Opts::new("aria_stage_visits_total", "Stage executions"),
        &["stage"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new("aria_stage_duration_seconds", "Stage execution duration in seconds")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["stage"],
    )?;

    let oracle_calls_total = CounterVec::new(
        Opts::new("aria_oracle_calls_total", "Oracle calls"),
        &["model", "outcome"],
    )?;

    let oracle_latency = HistogramVec::new(
        HistogramOpts::new("aria_oracle_latency_seconds", "Oracle call latency in seconds")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 120.0]),
        &["model"],
    )?;

    let synthesis_total = CounterVec::new(
        Opts::new("aria_synthesis_total", "Capability synthesis runs"),
        &["outcome"],
    )?;

    let synthesis_repairs = Histogram::with_opts(
        HistogramOpts::new("aria_synthesis_repairs", "Repair attempts per synthesis run")
            .buckets(vec![0.0, 1.0, 2.0, 3.0]),
    )?;

    let render_failures_total = CounterVec::new(
        Opts::new("aria_render_failures_total", "Renderer failures"),
        &["format"],
    )?;

    let active_runs = Gauge::new("aria_active_runs", "Runs currently executing stages")?;

    let registered_capabilities = Gauge::new(
        "aria_registered_capabilities",
        "Capabilities currently present in the registry",
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(stage_visits_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(oracle_calls_total.clone()))?;
    registry.register(Box::new(oracle_latency.clone()))?;
    registry.register(Box::new(synthesis_total.clone()))?;
    registry.register(Box::new(synthesis_repairs.clone()))?;
    registry.register(Box::new(render_failures_total.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;
    registry.register(Box::new(registered_capabilities.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = STAGE_VISITS_TOTAL.set(stage_visits_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = ORACLE_CALLS_TOTAL.set(oracle_calls_total);
    let _ = ORACLE_LATENCY.set(oracle_latency);
    let _ = SYNTHESIS_TOTAL.set(synthesis_total);
    let _ = SYNTHESIS_REPAIRS.set(synthesis_repairs);
    let _ = RENDER_FAILURES_TOTAL.set(render_failures_total);
    let _ = ACTIVE_RUNS.set(active_runs);
    let _ = REGISTERED_CAPABILITIES.set(registered_capabilities);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when metrics were never
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        // A second registry is built and discarded; the first stays installed.
        let _ = init_metrics();
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        if let Some(counter) = RUNS_TOTAL.get() {
            counter.with_label_values(&["done"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("aria_runs_total"));
    }
}
