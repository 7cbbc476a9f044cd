//! Emission of measured questions.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::metrics;

/// One measured question attributed to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySample {
    /// Fully-qualified query name.
    pub name: String,
    /// Record type text, e.g. `AAAA`.
    pub record_type: String,
    /// Namespace of the issuing workload.
    pub namespace: String,
    /// Name of the issuing workload.
    pub workload: String,
}

/// Destination for measured questions.
///
/// Implementations must not block: the pipeline calls them inline for every
/// surviving question.
pub trait QuerySink: Send + Sync {
    /// Add one to the counter keyed by the sample.
    fn increment(&self, sample: &QuerySample);

    /// Write the sample as a log line.
    fn log(&self, sample: &QuerySample);
}

/// Sink backed by the `metrics` facade and `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetrySink;

impl QuerySink for TelemetrySink {
    fn increment(&self, sample: &QuerySample) {
        metrics::record_query(
            &sample.name,
            &sample.record_type,
            &sample.namespace,
            &sample.workload,
        );
    }

    fn log(&self, sample: &QuerySample) {
        info!(
            name = %sample.name,
            qtype = %sample.record_type,
            namespace = %sample.namespace,
            workload = %sample.workload,
            "dns query"
        );
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    increments: Arc<Mutex<Vec<QuerySample>>>,
    logs: Arc<Mutex<Vec<QuerySample>>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every increment, in call order.
    pub fn increments(&self) -> Vec<QuerySample> {
        self.increments.lock().clone()
    }

    /// Every logged sample, in call order.
    pub fn logs(&self) -> Vec<QuerySample> {
        self.logs.lock().clone()
    }

    /// Counter value for one label set.
    pub fn count(&self, name: &str, record_type: &str, namespace: &str, workload: &str) -> usize {
        self.increments
            .lock()
            .iter()
            .filter(|s| {
                s.name == name
                    && s.record_type == record_type
                    && s.namespace == namespace
                    && s.workload == workload
            })
            .count()
    }
}

impl QuerySink for CollectingSink {
    fn increment(&self, sample: &QuerySample) {
        self.increments.lock().push(sample.clone());
    }

    fn log(&self, sample: &QuerySample) {
        self.logs.lock().push(sample.clone());
    }
}
