//! Prometheus metrics for the aggregation engine
//!
//! One collector is shared by every repository handled by an engine instance.
use parking_lot::RwLock;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;
use tracing::warn;

/// Labels for index operation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// Repository identifier
    pub repository: String,
    /// Operation name (e.g., "update_artifacts", "rebuild")
    pub operation: String,
    /// Outcome ("applied", "failed", "disabled", ...)
    pub outcome: String,
}

/// Labels for duration histograms
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub operation: String,
}

/// Labels for failure metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub repository: String,
    /// Error category
    pub error_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RepositoryLabels {
    pub repository: String,
}

/// Central metrics collector with Prometheus registry
pub struct AggregatorMetrics {
    registry: RwLock<Registry>,

    /// Index operations by repository, operation and outcome
    pub p2_operations_total: Family<OperationLabels, Counter>,

    /// Operation duration in seconds by operation
    pub p2_operation_duration_seconds: Family<DurationLabels, Histogram>,

    /// Failures by repository and error category
    pub p2_failures_total: Family<FailureLabels, Counter>,

    /// Fragments folded in by scan-and-rebuild
    pub p2_rebuild_fragments_total: Family<RepositoryLabels, Counter>,

    /// Fragments skipped by scan-and-rebuild because they failed
    pub p2_rebuild_fragment_failures_total: Family<RepositoryLabels, Counter>,
}

impl AggregatorMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let p2_operations_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "p2_operations",
            "Total number of aggregate index operations",
            p2_operations_total.clone(),
        );

        let p2_operation_duration_seconds =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 5ms up to roughly 40s
                Histogram::new(exponential_buckets(0.005, 2.5, 10))
            });
        registry.register(
            "p2_operation_duration_seconds",
            "Aggregate index operation latency in seconds",
            p2_operation_duration_seconds.clone(),
        );

        let p2_failures_total = Family::<FailureLabels, Counter>::default();
        registry.register(
            "p2_failures",
            "Total number of failed operations by error category",
            p2_failures_total.clone(),
        );

        let p2_rebuild_fragments_total = Family::<RepositoryLabels, Counter>::default();
        registry.register(
            "p2_rebuild_fragments",
            "Fragments applied during scan-and-rebuild",
            p2_rebuild_fragments_total.clone(),
        );

        let p2_rebuild_fragment_failures_total = Family::<RepositoryLabels, Counter>::default();
        registry.register(
            "p2_rebuild_fragment_failures",
            "Fragments skipped during scan-and-rebuild",
            p2_rebuild_fragment_failures_total.clone(),
        );

        Self {
            registry: RwLock::new(registry),
            p2_operations_total,
            p2_operation_duration_seconds,
            p2_failures_total,
            p2_rebuild_fragments_total,
            p2_rebuild_fragment_failures_total,
        }
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(err) = encode(&mut buffer, &registry) {
            warn!(error = %err, "failed to encode metrics");
        }
        buffer
    }

    pub fn record_operation(
        &self,
        repository: &str,
        operation: &str,
        outcome: &str,
        duration: Duration,
    ) {
        self.p2_operations_total
            .get_or_create(&OperationLabels {
                repository: repository.to_string(),
                operation: operation.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();

        self.p2_operation_duration_seconds
            .get_or_create(&DurationLabels {
                operation: operation.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn record_failure(&self, repository: &str, error_type: &str) {
        self.p2_failures_total
            .get_or_create(&FailureLabels {
                repository: repository.to_string(),
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn record_rebuild_fragments(&self, repository: &str, applied: usize, failed: usize) {
        let labels = RepositoryLabels {
            repository: repository.to_string(),
        };
        self.p2_rebuild_fragments_total
            .get_or_create(&labels)
            .inc_by(applied as u64);
        self.p2_rebuild_fragment_failures_total
            .get_or_create(&labels)
            .inc_by(failed as u64);
    }

    /// Current value of the operation counter, mostly for assertions.
    pub fn operation_count(&self, repository: &str, operation: &str, outcome: &str) -> u64 {
        self.p2_operations_total
            .get_or_create(&OperationLabels {
                repository: repository.to_string(),
                operation: operation.to_string(),
                outcome: outcome.to_string(),
            })
            .get()
    }
}

impl Default for AggregatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_show_up_in_encoding() {
        let metrics = AggregatorMetrics::new();
        metrics.record_operation(
            "releases",
            "update_artifacts",
            "applied",
            Duration::from_millis(12),
        );
        metrics.record_failure("releases", "malformed_fragment");
        metrics.record_rebuild_fragments("releases", 3, 1);

        assert_eq!(metrics.operation_count("releases", "update_artifacts", "applied"), 1);
        let text = metrics.encode();
        assert!(text.contains("p2_operations_total"));
        assert!(text.contains("repository=\"releases\""));
        assert!(text.contains("error_type=\"malformed_fragment\""));
        assert!(text.contains("p2_rebuild_fragments_total"));
    }
}
