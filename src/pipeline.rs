//! The single-consumer decode, correlate, filter and emit loop.
//!
//! Records are handled strictly one at a time in arrival order. Nothing that
//! goes wrong with one record is allowed to affect the next.

use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn};

use crate::config::Config;
use crate::emit::{QuerySample, QuerySink};
use crate::envelope::{Envelope, Kind};
use crate::error::RecordError;
use crate::filter::{NameFilter, Verdict};
use crate::metrics::{self, FilterRule};
use crate::question::extract_questions;
use crate::registry::WorkloadRegistry;

/// Settings that may change while the pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Name rules.
    pub filter: NameFilter,
    /// Skip per-query log lines.
    pub quiet: bool,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            filter: NameFilter::from(&config.suffixes),
            quiet: config.quiet,
        }
    }
}

/// What happened to a record that decoded cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Not a client query; nothing measured.
    Ignored(Kind),
    /// No workload owns the source address; nothing measured.
    UnknownSource(IpAddr),
    /// Questions were run through the filter.
    Processed {
        /// Questions counted.
        emitted: usize,
        /// Questions rejected by a suffix rule.
        filtered: usize,
    },
}

/// Decodes records and emits the questions that survive filtering.
pub struct Pipeline {
    registry: WorkloadRegistry,
    settings: watch::Receiver<Settings>,
    sink: Arc<dyn QuerySink>,
}

impl Pipeline {
    /// Create a pipeline reading the given registry and settings.
    pub fn new(
        registry: WorkloadRegistry,
        settings: watch::Receiver<Settings>,
        sink: Arc<dyn QuerySink>,
    ) -> Self {
        Self {
            registry,
            settings,
            sink,
        }
    }

    /// Process one raw record.
    pub fn process(&self, raw: &[u8]) -> Result<Disposition, RecordError> {
        let envelope = Envelope::decode(raw)?;

        if !envelope.kind.is_client_query() {
            debug!(kind = ?envelope.kind, "ignoring non client-query message");
            return Ok(Disposition::Ignored(envelope.kind));
        }

        let questions = extract_questions(envelope.dns_payload()?)?;
        let source = envelope.source_address()?;

        let Some(identity) = self.registry.lookup(source) else {
            warn!(address = %source, "no workload found for address");
            return Ok(Disposition::UnknownSource(source));
        };

        let span = info_span!(
            "workload",
            workload = %identity.name,
            namespace = %identity.namespace,
            address = %source
        );
        let _guard = span.enter();

        let settings = self.settings.borrow();
        let mut emitted = 0;
        let mut filtered = 0;

        for question in questions {
            match settings.filter.evaluate(&question.name) {
                Verdict::Pass => {
                    let sample = QuerySample {
                        record_type: question.type_label(),
                        name: question.name,
                        namespace: identity.namespace.clone(),
                        workload: identity.name.clone(),
                    };
                    self.sink.increment(&sample);
                    if !settings.quiet {
                        self.sink.log(&sample);
                    }
                    emitted += 1;
                }
                Verdict::MissingRequired(suffix) => {
                    trace!(name = %question.name, %suffix, "missing required suffix");
                    metrics::record_filtered(FilterRule::Require);
                    filtered += 1;
                }
                Verdict::Denied(suffix) => {
                    trace!(name = %question.name, %suffix, "denied suffix");
                    metrics::record_filtered(FilterRule::Deny);
                    filtered += 1;
                }
            }
        }

        Ok(Disposition::Processed { emitted, filtered })
    }

    /// Process one record, logging and counting anything that was dropped.
    pub fn handle(&self, raw: &[u8]) {
        match self.process(raw) {
            Ok(Disposition::Processed { .. }) => {}
            Ok(Disposition::Ignored(_)) => metrics::record_dropped("not_client_query"),
            Ok(Disposition::UnknownSource(_)) => metrics::record_dropped("unknown_source"),
            Err(e) => {
                warn!(error = %e, "dropping dnstap record");
                metrics::record_dropped(e.reason());
            }
        }
    }

    /// Consume records until shutdown or until every producer is gone.
    /// Records still queued at shutdown are discarded.
    pub async fn run(self, mut records: mpsc::UnboundedReceiver<Bytes>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("pipeline received shutdown signal");
                    return;
                }

                record = records.recv() => {
                    match record {
                        Some(raw) => self.handle(&raw),
                        None => {
                            info!("record channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
