//! Exporter Metrics
//!
//! Prometheus collectors for the reconciliation pipeline. Collectors are
//! registered on a caller-supplied registry so tests can use a private one.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics for the exporter pipeline
#[derive(Clone)]
pub struct ExporterMetrics {
    /// Export records written, by kind
    pub exports: IntCounterVec,
    /// Reconciliation passes, by outcome
    pub reconciliations: IntCounterVec,
    /// Optimistic-concurrency conflicts on write
    pub conflicts: IntCounter,
    /// Deferred reconciliations, by reason
    pub deferrals: IntCounterVec,
    /// Invariant violations detected
    pub invariant_violations: IntCounter,
    /// Keys waiting in the work queue
    pub queue_depth: IntGauge,
    /// Keys waiting for a retry timer
    pub pending_retries: IntGauge,
    /// Duration of a reconciliation pass
    pub reconcile_duration: Histogram,
}

impl ExporterMetrics {
    /// Create and register all collectors
    pub fn register(registry: &Registry) -> Result<Self> {
        let exports = IntCounterVec::new(
            Opts::new(
                "volume_events_exports_total",
                "Export records written to backend claims",
            ),
            &["kind"],
        )?;
        let reconciliations = IntCounterVec::new(
            Opts::new(
                "volume_events_reconciliations_total",
                "Reconciliation passes by outcome",
            ),
            &["outcome"],
        )?;
        let conflicts = IntCounter::new(
            "volume_events_write_conflicts_total",
            "Version conflicts while annotating backend claims",
        )?;
        let deferrals = IntCounterVec::new(
            Opts::new(
                "volume_events_deferrals_total",
                "Reconciliations deferred until the backend is ready",
            ),
            &["reason"],
        )?;
        let invariant_violations = IntCounter::new(
            "volume_events_invariant_violations_total",
            "Backend claims holding export values that disagree with observed state",
        )?;
        let queue_depth = IntGauge::new(
            "volume_events_queue_depth",
            "Volumes waiting for reconciliation",
        )?;
        let pending_retries = IntGauge::new(
            "volume_events_pending_retries",
            "Volumes waiting for a retry timer",
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "volume_events_reconcile_duration_seconds",
            "Duration of reconciliation passes",
        ))?;

        registry.register(Box::new(exports.clone()))?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(deferrals.clone()))?;
        registry.register(Box::new(invariant_violations.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(pending_retries.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            exports,
            reconciliations,
            conflicts,
            deferrals,
            invariant_violations,
            queue_depth,
            pending_retries,
            reconcile_duration,
        })
    }
}

impl std::fmt::Debug for ExporterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterMetrics")
            .field("conflicts", &self.conflicts.get())
            .field("queue_depth", &self.queue_depth.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        assert!(ExporterMetrics::register(&registry).is_ok());
        assert!(ExporterMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_counters_gathered() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::register(&registry).unwrap();
        metrics.exports.with_label_values(&["create"]).inc();
        metrics.conflicts.inc();

        let families = registry.gather();
        let exports = families
            .iter()
            .find(|f| f.get_name() == "volume_events_exports_total")
            .unwrap();
        assert_eq!(exports.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
