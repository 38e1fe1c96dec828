//! Metrics for [super::LogCache].

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [super::LogCache].
#[derive(Default)]
pub struct Metrics {
    /// Entries currently resident.
    pub ops: Gauge,
    /// Bytes currently resident.
    pub bytes: Gauge,
    /// Appends accepted.
    pub appends: Counter,
    /// Reads that missed and scheduled a fill.
    pub misses: Counter,
    /// Fills merged into the cache.
    pub fills: Counter,
}

impl Metrics {
    /// Create and register metrics with the given context.
    ///
    /// Metric names will be prefixed with the context's label.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("ops", "Entries currently resident", metrics.ops.clone());
        context.register("bytes", "Bytes currently resident", metrics.bytes.clone());
        context.register("appends", "Appends accepted", metrics.appends.clone());
        context.register(
            "misses",
            "Reads that missed and scheduled a fill",
            metrics.misses.clone(),
        );
        context.register("fills", "Fills merged into the cache", metrics.fills.clone());
        metrics
    }
}
