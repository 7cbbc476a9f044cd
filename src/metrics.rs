//! Metrics instrumentation for kube-dnstap.
//!
//! All metrics are prefixed with `kube_dnstap.`

use metrics::{counter, gauge};

/// Count one surviving DNS question.
pub fn record_query(name: &str, record_type: &str, namespace: &str, workload: &str) {
    counter!(
        "kube_dnstap.query.count",
        "name" => name.to_string(),
        "type" => record_type.to_string(),
        "namespace" => namespace.to_string(),
        "workload" => workload.to_string()
    )
    .increment(1);
}

/// Record a data frame handed to the pipeline.
pub fn record_frame() {
    counter!("kube_dnstap.frame.count").increment(1);
}

/// Record a raw record that produced no questions to filter.
pub fn record_dropped(reason: &'static str) {
    counter!("kube_dnstap.record.dropped.count", "reason" => reason).increment(1);
}

/// Record a question rejected by a suffix rule.
pub fn record_filtered(rule: FilterRule) {
    let rule_str = match rule {
        FilterRule::Require => "require",
        FilterRule::Deny => "deny",
    };

    counter!("kube_dnstap.question.filtered.count", "rule" => rule_str).increment(1);
}

/// Suffix rule that rejected a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRule {
    /// A required suffix was missing.
    Require,
    /// A denied suffix matched.
    Deny,
}

/// Record a frame stream connection lifecycle event.
pub fn record_connection(event: ConnectionEvent) {
    let event_str = match event {
        ConnectionEvent::Opened => "opened",
        ConnectionEvent::Closed => "closed",
        ConnectionEvent::Error => "error",
    };

    counter!("kube_dnstap.connection.count", "event" => event_str).increment(1);
}

/// Frame stream connection events.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionEvent {
    /// Connection accepted.
    Opened,
    /// Connection finished cleanly.
    Closed,
    /// Connection dropped on a read or framing error.
    Error,
}

/// Record a registry update applied from the pod watch.
pub fn record_registry_event(event: RegistryEventType) {
    let event_str = match event {
        RegistryEventType::Added => "added",
        RegistryEventType::Updated => "updated",
        RegistryEventType::Deleted => "deleted",
        RegistryEventType::Resynced => "resynced",
    };

    counter!("kube_dnstap.registry.event.count", "event" => event_str).increment(1);
}

/// Registry update kinds.
#[derive(Debug, Clone, Copy)]
pub enum RegistryEventType {
    /// New address mapped.
    Added,
    /// Existing address remapped.
    Updated,
    /// Address removed.
    Deleted,
    /// Whole registry replaced by a relist.
    Resynced,
}

/// Record the number of addresses in the registry.
pub fn record_registry_size(entries: usize) {
    gauge!("kube_dnstap.registry.entries").set(entries as f64);
}
