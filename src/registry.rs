//! IP address to workload registry.
//!
//! The registry is written by the pod watch and read by the pipeline. It is
//! eventually consistent with the cluster: an address can briefly map to a
//! workload that no longer owns it, or to nothing at all. Each key holds at
//! most one identity and the last write wins.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CollectorError;
use crate::metrics::{self, RegistryEventType};

/// Name and namespace of the pod that owns an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
}

impl WorkloadIdentity {
    /// Build an identity from name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A change delivered by the registry collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An address started belonging to a workload.
    Added {
        /// Address.
        ip: IpAddr,
        /// New owner.
        identity: WorkloadIdentity,
    },
    /// A known workload was modified; its address mapping is rewritten.
    Updated {
        /// Address.
        ip: IpAddr,
        /// Current owner.
        identity: WorkloadIdentity,
    },
    /// An address no longer belongs to anyone.
    Deleted {
        /// Address.
        ip: IpAddr,
    },
    /// The watch relisted; this is the complete current mapping.
    Resynced(Vec<(IpAddr, WorkloadIdentity)>),
}

/// Thread-safe address to workload map.
#[derive(Debug, Clone, Default)]
pub struct WorkloadRegistry {
    inner: Arc<RwLock<HashMap<IpAddr, WorkloadIdentity>>>,
}

/// IPv4-mapped IPv6 addresses are stored and looked up as plain IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

impl WorkloadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole mapping with a snapshot.
    pub fn load_snapshot(&self, entries: impl IntoIterator<Item = (IpAddr, WorkloadIdentity)>) {
        let map: HashMap<IpAddr, WorkloadIdentity> = entries
            .into_iter()
            .map(|(ip, identity)| (canonical(ip), identity))
            .collect();
        let count = map.len();
        *self.inner.write() = map;
        debug!(entries = count, "loaded registry snapshot");
    }

    /// Insert or overwrite the owner of `ip`. Returns the previous owner.
    pub fn upsert(&self, ip: IpAddr, identity: WorkloadIdentity) -> Option<WorkloadIdentity> {
        debug!(%ip, workload = %identity, "upserting workload address");
        self.inner.write().insert(canonical(ip), identity)
    }

    /// Forget the owner of `ip`. Returns the removed owner.
    pub fn remove(&self, ip: IpAddr) -> Option<WorkloadIdentity> {
        let removed = self.inner.write().remove(&canonical(ip));
        if let Some(ref identity) = removed {
            debug!(%ip, workload = %identity, "removed workload address");
        }
        removed
    }

    /// Current owner of `ip`, if any.
    pub fn lookup(&self, ip: IpAddr) -> Option<WorkloadIdentity> {
        self.inner.read().get(&canonical(ip)).cloned()
    }

    /// Number of mapped addresses.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no address is mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Apply one collaborator event.
    pub fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added { ip, identity } => {
                self.upsert(ip, identity);
                metrics::record_registry_event(RegistryEventType::Added);
            }
            RegistryEvent::Updated { ip, identity } => {
                self.upsert(ip, identity);
                metrics::record_registry_event(RegistryEventType::Updated);
            }
            RegistryEvent::Deleted { ip } => {
                self.remove(ip);
                metrics::record_registry_event(RegistryEventType::Deleted);
            }
            RegistryEvent::Resynced(entries) => {
                self.load_snapshot(entries);
                metrics::record_registry_event(RegistryEventType::Resynced);
            }
        }
        metrics::record_registry_size(self.len());
    }
}

/// A live event stream from a [`WorkloadSource`].
#[derive(Debug)]
pub struct Subscription {
    /// Events in arrival order. Buffers until drained.
    pub events: mpsc::UnboundedReceiver<RegistryEvent>,
    /// Task producing the events; finishes once shutdown is requested.
    pub task: JoinHandle<()>,
}

/// External provider of workload addresses.
///
/// Implementations must not lose changes between [`subscribe`] and
/// [`snapshot`]: every change after the subscription is established has to
/// reach the event channel, and a relist must arrive as
/// [`RegistryEvent::Resynced`]. The collector subscribes first, loads the
/// snapshot, then replays the buffered events.
///
/// [`subscribe`]: WorkloadSource::subscribe
/// [`snapshot`]: WorkloadSource::snapshot
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Start watching for changes until `shutdown` is cancelled.
    async fn subscribe(&self, shutdown: CancellationToken) -> Result<Subscription, CollectorError>;

    /// List every currently known address and its owner.
    async fn snapshot(&self) -> Result<Vec<(IpAddr, WorkloadIdentity)>, CollectorError>;
}

/// Apply events to the registry until the stream ends or shutdown.
pub async fn apply_events(
    registry: WorkloadRegistry,
    mut events: mpsc::UnboundedReceiver<RegistryEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("registry updater shutting down");
                return;
            }

            event = events.recv() => {
                match event {
                    Some(event) => registry.apply(event),
                    None => {
                        info!("registry event stream ended");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_then_lookup() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("10.0.0.5"), WorkloadIdentity::new("web-7f", "default"));

        assert_eq!(
            registry.lookup(ip("10.0.0.5")),
            Some(WorkloadIdentity::new("web-7f", "default"))
        );
        assert_eq!(registry.lookup(ip("10.0.0.6")), None);
    }

    #[test]
    fn test_last_write_wins() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("10.0.0.5"), WorkloadIdentity::new("w1", "default"));
        let previous = registry.upsert(ip("10.0.0.5"), WorkloadIdentity::new("w2", "default"));

        assert_eq!(previous, Some(WorkloadIdentity::new("w1", "default")));
        assert_eq!(registry.lookup(ip("10.0.0.5")).unwrap().name, "w2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_update_delete_converges_to_absent() {
        let registry = WorkloadRegistry::new();
        let addr = ip("10.0.0.5");

        registry.apply(RegistryEvent::Added {
            ip: addr,
            identity: WorkloadIdentity::new("w1", "default"),
        });
        registry.apply(RegistryEvent::Updated {
            ip: addr,
            identity: WorkloadIdentity::new("w2", "default"),
        });
        registry.apply(RegistryEvent::Deleted { ip: addr });

        assert_eq!(registry.lookup(addr), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delete_of_unknown_address_is_noop() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("10.0.0.1"), WorkloadIdentity::new("a", "ns"));
        assert_eq!(registry.remove(ip("10.0.0.2")), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_replaces_previous_entries() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("10.0.0.1"), WorkloadIdentity::new("old", "ns"));

        registry.apply(RegistryEvent::Resynced(vec![(
            ip("10.0.0.2"),
            WorkloadIdentity::new("new", "ns"),
        )]));

        assert_eq!(registry.lookup(ip("10.0.0.1")), None);
        assert_eq!(registry.lookup(ip("10.0.0.2")).unwrap().name, "new");
    }

    #[test]
    fn test_ipv4_mapped_lookup_hits_ipv4_entry() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("10.0.0.5"), WorkloadIdentity::new("web", "default"));

        assert!(registry.lookup(ip("::ffff:10.0.0.5")).is_some());
    }

    #[test]
    fn test_ipv6_entries() {
        let registry = WorkloadRegistry::new();
        registry.upsert(ip("fd00::1"), WorkloadIdentity::new("web", "default"));

        assert!(registry.lookup(ip("fd00:0:0:0:0:0:0:1")).is_some());
        assert!(registry.lookup(ip("fd00::2")).is_none());
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let registry = WorkloadRegistry::new();
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let addr = IpAddr::from([10, 0, (i / 256) as u8, (i % 256) as u8]);
                    registry.upsert(addr, WorkloadIdentity::new(format!("pod-{i}"), "ns"));
                    if i % 3 == 0 {
                        registry.remove(addr);
                    }
                }
            })
        };

        for i in 0..2000u32 {
            let addr = IpAddr::from([10, 0, (i / 256) as u8, (i % 256) as u8]);
            if let Some(identity) = registry.lookup(addr) {
                assert_eq!(identity.name, format!("pod-{i}"));
            }
        }

        writer.join().unwrap();
        assert_eq!(registry.len(), 2000 - 667);
    }

    #[tokio::test]
    async fn test_apply_events_in_arrival_order() {
        let registry = WorkloadRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = ip("10.0.0.5");

        tx.send(RegistryEvent::Added {
            ip: addr,
            identity: WorkloadIdentity::new("w1", "default"),
        })
        .unwrap();
        tx.send(RegistryEvent::Updated {
            ip: addr,
            identity: WorkloadIdentity::new("w2", "default"),
        })
        .unwrap();
        tx.send(RegistryEvent::Deleted { ip: addr }).unwrap();
        drop(tx);

        apply_events(registry.clone(), rx, CancellationToken::new()).await;

        assert_eq!(registry.lookup(addr), None);
    }

    #[tokio::test]
    async fn test_apply_events_stops_on_shutdown() {
        let registry = WorkloadRegistry::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // Returns even though the sender is still alive.
        apply_events(registry, rx, shutdown).await;
    }
}
