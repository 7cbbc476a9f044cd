//! kube-dnstap - Per-workload DNS query telemetry for Kubernetes clusters.
//!
//! This crate receives dnstap records from a cluster DNS server over Frame
//! Streams, attributes every client query to the pod that sent it, and
//! counts each question by name, record type, namespace and workload.
//! Queries for cluster-internal names can be excluded with suffix rules.
//!
//! ## Features
//!
//! - Frame Streams receiver (bidirectional and unidirectional senders)
//! - Pod address registry kept current by a Kubernetes watch
//! - Require/deny suffix rules, reloaded when the config file changes or on SIGHUP
//! - Prometheus counters and structured per-query logs
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          kube-dnstap                             │
//! │                                                                  │
//! │  ┌──────────────────┐    ┌──────────────────┐                    │
//! │  │ Kubernetes API   │───▶│ Workload         │                    │
//! │  │ (pod list/watch) │    │ Registry         │                    │
//! │  └──────────────────┘    └────────┬─────────┘                    │
//! │                                   │ lookup                       │
//! │  ┌──────────────────┐  records  ┌─▼────────────────┐  counters   │
//! │  │ Frame Source     │──────────▶│ Pipeline         │──▶ + logs   │
//! │  │ (fstrm over TCP) │           │ decode → filter  │             │
//! │  └──────▲───────────┘           └──────────────────┘             │
//! │         │                                                        │
//! └─────────┼────────────────────────────────────────────────────────┘
//!           │ dnstap
//!     cluster DNS server
//! ```
//!
//! ## Record handling
//!
//! ```text
//! raw frame
//!   → decode dnstap envelope, keep CLIENT_QUERY only
//!   → unpack DNS message, take questions in wire order
//!   → look up the query address in the registry
//!   → apply require and deny suffix rules
//!   → increment (name, type, namespace, workload), log unless quiet
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kube_dnstap::{Collector, Config, KubePodSource, Settings, TelemetrySink};
//! use tokio::sync::watch;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let (_settings_tx, settings) = watch::channel(Settings::from(&config));
//!
//!     let source = KubePodSource::try_default(&config.kubernetes).await?;
//!     let collector = Collector::new(config.listen, settings, Arc::new(TelemetrySink));
//!
//!     collector.run(source, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod collector;
pub mod config;
pub mod emit;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod framestream;
pub mod kubernetes;
pub mod metrics;
pub mod pipeline;
pub mod question;
pub mod registry;
pub mod reload;
pub mod telemetry;

// Re-export main types
pub use collector::{Collector, Phase};
pub use config::{Config, ListenConfig, SuffixConfig, TelemetryConfig};
pub use emit::{CollectingSink, QuerySample, QuerySink, TelemetrySink};
pub use error::{CollectorError, FrameError, RecordError};
pub use filter::{NameFilter, Verdict};
pub use kubernetes::KubePodSource;
pub use pipeline::{Pipeline, Settings};
pub use registry::{RegistryEvent, WorkloadIdentity, WorkloadRegistry, WorkloadSource};
pub use reload::{ConfigReloader, ReloadTrigger};
