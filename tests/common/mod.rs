//! Shared test infrastructure for collector integration tests.

#![allow(dead_code)]

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use kube_dnstap::envelope::{encode_client_query, encode_message, MessageKind};
use kube_dnstap::filter::NameFilter;
use kube_dnstap::pipeline::{Pipeline, Settings};
use kube_dnstap::registry::{
    RegistryEvent, Subscription, WorkloadIdentity, WorkloadRegistry, WorkloadSource,
};
use kube_dnstap::{CollectingSink, CollectorError};

// --- Constants ---

pub const WEB_IP: &str = "10.0.0.5";
pub const WEB_POD: &str = "web-7f";
pub const NAMESPACE: &str = "default";

// --- DNS message construction ---

/// Build wire-format bytes for a DNS query with the given questions.
pub fn build_query_bytes(questions: &[(&str, RecordType)], id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    for (name, record_type) in questions {
        let mut query = Query::new();
        query.set_name(Name::from_ascii(name).unwrap());
        query.set_query_type(*record_type);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
    }
    msg.to_vec().unwrap()
}

/// Build an encoded dnstap CLIENT_QUERY record.
pub fn client_query(source: &str, questions: &[(&str, RecordType)]) -> Vec<u8> {
    encode_client_query(source.parse().unwrap(), build_query_bytes(questions, 1))
}

/// Build an encoded dnstap record of any kind carrying a query message.
pub fn record_of_kind(kind: MessageKind, source: &str, name: &str) -> Vec<u8> {
    encode_message(
        kind,
        source.parse().unwrap(),
        Some(build_query_bytes(&[(name, RecordType::A)], 1)),
        None,
    )
}

// --- Pipeline harness ---

/// A pipeline wired to a recording sink, with its registry and settings
/// exposed for manipulation.
pub struct Harness {
    pub pipeline: Pipeline,
    pub registry: WorkloadRegistry,
    pub sink: CollectingSink,
    pub settings: watch::Sender<Settings>,
}

impl Harness {
    /// Harness with `web-7f` registered at `10.0.0.5` and the given rules.
    pub fn new(require: &[&str], deny: &[&str]) -> Self {
        let registry = WorkloadRegistry::new();
        registry.upsert(
            WEB_IP.parse().unwrap(),
            WorkloadIdentity::new(WEB_POD, NAMESPACE),
        );
        let sink = CollectingSink::new();
        let (settings, rx) = watch::channel(Settings {
            filter: NameFilter::new(strings(require), strings(deny)),
            quiet: false,
        });
        let pipeline = Pipeline::new(registry.clone(), rx, Arc::new(sink.clone()));
        Self {
            pipeline,
            registry,
            sink,
            settings,
        }
    }
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

// --- Workload source ---

/// In-memory workload source. Events pushed with [`StaticSource::push`]
/// before `subscribe` are delivered once it is called.
#[derive(Clone, Default)]
pub struct StaticSource {
    snapshot: Arc<Mutex<Vec<(IpAddr, WorkloadIdentity)>>>,
    pending: Arc<Mutex<Vec<RegistryEvent>>>,
    live: Arc<Mutex<Option<mpsc::UnboundedSender<RegistryEvent>>>>,
}

impl StaticSource {
    pub fn with_pod(ip: &str, name: &str, namespace: &str) -> Self {
        let source = Self::default();
        source
            .snapshot
            .lock()
            .push((ip.parse().unwrap(), WorkloadIdentity::new(name, namespace)));
        source
    }

    /// Deliver an event to the subscriber, or queue it until there is one.
    pub fn push(&self, event: RegistryEvent) {
        let live = self.live.lock();
        match live.as_ref() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => self.pending.lock().push(event),
        }
    }
}

#[async_trait]
impl WorkloadSource for StaticSource {
    async fn subscribe(&self, shutdown: CancellationToken) -> Result<Subscription, CollectorError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut live = self.live.lock();
        for event in self.pending.lock().drain(..) {
            let _ = tx.send(event);
        }
        *live = Some(tx);
        drop(live);

        let live = Arc::clone(&self.live);
        let task = tokio::spawn(async move {
            shutdown.cancelled().await;
            live.lock().take();
        });
        Ok(Subscription { events, task })
    }

    async fn snapshot(&self) -> Result<Vec<(IpAddr, WorkloadIdentity)>, CollectorError> {
        Ok(self.snapshot.lock().clone())
    }
}

// --- Log capture ---

/// Events recorded by [`capture_logs`], as `(level, message)`.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    /// Messages logged at exactly `level`.
    pub fn at(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

struct CaptureLayer(CapturedLogs);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.0
            .events
            .lock()
            .push((*event.metadata().level(), message.0));
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

/// Run `f` with every tracing event on this thread recorded.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, CapturedLogs) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer(logs.clone()));
    let output = tracing::subscriber::with_default(subscriber, f);
    (output, logs)
}
