//! Collector setup and lifecycle management.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ListenConfig;
use crate::emit::QuerySink;
use crate::error::CollectorError;
use crate::framestream::FrameSource;
use crate::metrics;
use crate::pipeline::{Pipeline, Settings};
use crate::registry::{self, WorkloadRegistry, WorkloadSource};

/// Lifecycle phase of a [`Collector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Binding the listener and loading the registry.
    Starting,
    /// Processing records.
    Running,
    /// Waiting for connections and the registry watch to stop.
    Draining,
    /// Everything has been joined.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// dnstap collector attributing DNS questions to workloads.
pub struct Collector {
    listen: ListenConfig,
    registry: WorkloadRegistry,
    settings: watch::Receiver<Settings>,
    sink: Arc<dyn QuerySink>,
    phase: watch::Sender<Phase>,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl Collector {
    /// Create a collector. `settings` carries the filter rules and may be
    /// updated while the collector runs.
    pub fn new(
        listen: ListenConfig,
        settings: watch::Receiver<Settings>,
        sink: Arc<dyn QuerySink>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        let (bound, _) = watch::channel(None);
        Self {
            listen,
            registry: WorkloadRegistry::new(),
            settings,
            sink,
            phase,
            bound,
        }
    }

    /// Get a reference to the workload registry.
    pub fn registry(&self) -> &WorkloadRegistry {
        &self.registry
    }

    /// Observe lifecycle transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Observe the address the listener bound to once it is known.
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }

    fn transition(&self, phase: Phase) {
        info!(%phase, "collector phase");
        self.phase.send_replace(phase);
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails without processing anything when the listener cannot be bound
    /// or the initial workload snapshot cannot be taken.
    pub async fn run<S>(self, source: S, shutdown: CancellationToken) -> Result<(), CollectorError>
    where
        S: WorkloadSource,
    {
        info!(
            listen_addr = %self.listen.addr,
            max_frame_size = self.listen.max_frame_size,
            "Starting kube-dnstap collector"
        );
        self.transition(Phase::Starting);

        let result = self.start_and_serve(&source, shutdown).await;
        if let Err(ref e) = result {
            error!(error = %e, "collector failed to start");
        }

        self.transition(Phase::Stopped);
        result
    }

    async fn start_and_serve<S>(
        &self,
        source: &S,
        shutdown: CancellationToken,
    ) -> Result<(), CollectorError>
    where
        S: WorkloadSource,
    {
        let frames = FrameSource::bind(self.listen.addr, self.listen.max_frame_size).await?;
        self.bound.send_replace(Some(frames.local_addr()?));

        // Changes seen while the snapshot is taken stay buffered in the
        // subscription and are replayed on top of it.
        let subscription = source.subscribe(shutdown.clone()).await?;
        let snapshot = match source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                shutdown.cancel();
                let _ = subscription.task.await;
                return Err(e);
            }
        };
        self.registry.load_snapshot(snapshot);
        metrics::record_registry_size(self.registry.len());
        info!(addresses = self.registry.len(), "initial workload snapshot loaded");

        let updater = tokio::spawn(registry::apply_events(
            self.registry.clone(),
            subscription.events,
            shutdown.clone(),
        ));

        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let frame_task = tokio::spawn(frames.run(records_tx, shutdown.clone()));

        let pipeline = Pipeline::new(
            self.registry.clone(),
            self.settings.clone(),
            Arc::clone(&self.sink),
        );

        self.transition(Phase::Running);
        pipeline.run(records_rx, shutdown.clone()).await;

        self.transition(Phase::Draining);
        // The pipeline also ends when every producer is gone; make sure the
        // rest follows it down.
        shutdown.cancel();

        if let Err(e) = frame_task.await {
            warn!(error = %e, "frame source task failed");
        }
        if let Err(e) = updater.await {
            warn!(error = %e, "registry updater task failed");
        }
        if let Err(e) = subscription.task.await {
            warn!(error = %e, "registry watch task failed");
        }

        info!("collector drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::CollectingSink;
    use crate::registry::{RegistryEvent, Subscription, WorkloadIdentity};
    use async_trait::async_trait;
    use std::net::IpAddr;

    struct FailingSource;

    #[async_trait]
    impl WorkloadSource for FailingSource {
        async fn subscribe(
            &self,
            shutdown: CancellationToken,
        ) -> Result<Subscription, CollectorError> {
            let (_tx, events) = mpsc::unbounded_channel::<RegistryEvent>();
            let task = tokio::spawn(async move { shutdown.cancelled().await });
            Ok(Subscription { events, task })
        }

        async fn snapshot(&self) -> Result<Vec<(IpAddr, WorkloadIdentity)>, CollectorError> {
            Err(CollectorError::Snapshot("api unavailable".to_string()))
        }
    }

    fn collector(addr: SocketAddr) -> Collector {
        let (_tx, settings) = watch::channel(Settings::default());
        Collector::new(
            ListenConfig {
                addr,
                max_frame_size: 1024,
            },
            settings,
            Arc::new(CollectingSink::new()),
        )
    }

    #[test]
    fn test_collector_creation() {
        let collector = collector("127.0.0.1:0".parse().unwrap());
        assert!(collector.registry().is_empty());
        assert_eq!(*collector.phase().borrow(), Phase::Starting);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_fatal() {
        let collector = collector("127.0.0.1:0".parse().unwrap());
        let phase = collector.phase();

        let result = collector.run(FailingSource, CancellationToken::new()).await;

        assert!(matches!(result, Err(CollectorError::Snapshot(_))));
        assert_eq!(*phase.borrow(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let collector = collector(taken.local_addr().unwrap());

        let result = collector.run(FailingSource, CancellationToken::new()).await;

        assert!(matches!(result, Err(CollectorError::Bind { .. })));
    }
}
