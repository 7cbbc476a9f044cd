//! Pod address source backed by the Kubernetes API.
//!
//! The snapshot is a plain pod list. Live changes come from a
//! `kube::runtime` watcher whose initial listing and every relist are
//! folded into a single [`RegistryEvent::Resynced`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::error::CollectorError;
use crate::registry::{RegistryEvent, Subscription, WorkloadIdentity, WorkloadSource};

/// Workload source listing and watching pods.
#[derive(Clone)]
pub struct KubePodSource {
    api: Api<Pod>,
}

impl KubePodSource {
    /// Connect using in-cluster credentials or the local kubeconfig.
    pub async fn try_default(config: &KubernetesConfig) -> Result<Self, CollectorError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    /// Build a source from an existing client.
    pub fn new(client: Client, config: &KubernetesConfig) -> Self {
        let api = match config.namespace.as_deref() {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        Self { api }
    }
}

#[async_trait]
impl WorkloadSource for KubePodSource {
    async fn subscribe(&self, shutdown: CancellationToken) -> Result<Subscription, CollectorError> {
        let (tx, events) = mpsc::unbounded_channel();
        let stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        let task = tokio::spawn(watch_pods(stream, tx, shutdown));
        Ok(Subscription { events, task })
    }

    async fn snapshot(&self) -> Result<Vec<(IpAddr, WorkloadIdentity)>, CollectorError> {
        let pods = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| CollectorError::Snapshot(e.to_string()))?;

        let entries: Vec<_> = pods.items.iter().flat_map(pod_entries).collect();
        info!(
            pods = pods.items.len(),
            addresses = entries.len(),
            "listed pods"
        );
        Ok(entries)
    }
}

async fn watch_pods(
    mut stream: BoxStream<'static, Result<Event<Pod>, watcher::Error>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    shutdown: CancellationToken,
) {
    let mut translator = PodEventTranslator::default();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("pod watch shutting down");
                return;
            }

            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        for update in translator.translate(event) {
                            if events.send(update).is_err() {
                                debug!("registry updater gone; stopping pod watch");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "pod watch error; retrying");
                    }
                    None => {
                        warn!("pod watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Turns pod watch events into registry events.
///
/// Remembers which addresses each pod last had so that an address a pod
/// gives up is retracted even when the pod itself lives on.
#[derive(Debug, Default)]
pub struct PodEventTranslator {
    known: HashMap<String, Vec<IpAddr>>,
    relist: Option<HashMap<String, Vec<(IpAddr, WorkloadIdentity)>>>,
}

impl PodEventTranslator {
    /// Translate one watch event.
    pub fn translate(&mut self, event: Event<Pod>) -> Vec<RegistryEvent> {
        match event {
            Event::Init => {
                self.relist = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(pod) => {
                if let (Some(relist), Some(key)) = (self.relist.as_mut(), pod_key(&pod)) {
                    relist.insert(key, pod_entries(&pod));
                }
                Vec::new()
            }
            Event::InitDone => {
                let relist = self.relist.take().unwrap_or_default();
                self.known = relist
                    .iter()
                    .map(|(key, entries)| (key.clone(), entries.iter().map(|(ip, _)| *ip).collect()))
                    .collect();
                let entries: Vec<_> = relist.into_values().flatten().collect();
                debug!(addresses = entries.len(), "pod watch relisted");
                vec![RegistryEvent::Resynced(entries)]
            }
            Event::Apply(pod) => self.apply(&pod),
            Event::Delete(pod) => self.delete(&pod),
        }
    }

    fn apply(&mut self, pod: &Pod) -> Vec<RegistryEvent> {
        let Some(key) = pod_key(pod) else {
            return Vec::new();
        };
        let entries = pod_entries(pod);
        let addresses: Vec<IpAddr> = entries.iter().map(|(ip, _)| *ip).collect();
        let previous = self.known.remove(&key);

        let mut updates: Vec<RegistryEvent> = previous
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|ip| !addresses.contains(ip))
            .map(|ip| RegistryEvent::Deleted { ip: *ip })
            .collect();

        for (ip, identity) in entries {
            let seen = previous.as_ref().is_some_and(|prev| prev.contains(&ip));
            updates.push(if seen {
                RegistryEvent::Updated { ip, identity }
            } else {
                RegistryEvent::Added { ip, identity }
            });
        }

        if !addresses.is_empty() {
            self.known.insert(key, addresses);
        }
        updates
    }

    fn delete(&mut self, pod: &Pod) -> Vec<RegistryEvent> {
        let addresses = pod_key(pod)
            .and_then(|key| self.known.remove(&key))
            .unwrap_or_else(|| pod_addresses(pod));

        addresses
            .into_iter()
            .map(|ip| RegistryEvent::Deleted { ip })
            .collect()
    }
}

/// Stable key for a pod: its UID, or namespace/name when the UID is unset.
fn pod_key(pod: &Pod) -> Option<String> {
    let meta = &pod.metadata;
    meta.uid.clone().or_else(|| {
        let name = meta.name.as_deref()?;
        Some(format!(
            "{}/{}",
            meta.namespace.as_deref().unwrap_or_default(),
            name
        ))
    })
}

fn pod_identity(pod: &Pod) -> Option<WorkloadIdentity> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    Some(WorkloadIdentity::new(name, namespace))
}

/// Every address in the pod status, falling back to `podIP`.
fn pod_addresses(pod: &Pod) -> Vec<IpAddr> {
    let Some(status) = pod.status.as_ref() else {
        return Vec::new();
    };

    let raw: Vec<&str> = match status.pod_ips.as_deref() {
        Some(ips) if !ips.is_empty() => ips.iter().map(|ip| ip.ip.as_str()).collect(),
        _ => status.pod_ip.as_deref().into_iter().collect(),
    };

    let mut addresses = Vec::with_capacity(raw.len());
    for text in raw.into_iter().filter(|s| !s.is_empty()) {
        match text.parse::<IpAddr>() {
            Ok(ip) => {
                let ip = ip.to_canonical();
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
            Err(e) => {
                warn!(address = text, error = %e, "ignoring unparseable pod address");
            }
        }
    }
    addresses
}

fn pod_entries(pod: &Pod) -> Vec<(IpAddr, WorkloadIdentity)> {
    let Some(identity) = pod_identity(pod) else {
        return Vec::new();
    };
    pod_addresses(pod)
        .into_iter()
        .map(|ip| (ip, identity.clone()))
        .collect()
}
