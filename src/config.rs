//! Configuration types for kube-dnstap.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::CollectorError;

/// Base name of the configuration file searched for when no path is given.
pub const CONFIG_NAME: &str = "kube-dnstap";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "KUBE_DNSTAP";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// dnstap listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Name filter rules.
    #[serde(default)]
    pub suffixes: SuffixConfig,

    /// Suppress the per-query log line (counters are still incremented).
    #[serde(default)]
    pub quiet: bool,

    /// Pod registry configuration.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Frame stream listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address the dnstap frame stream listener binds to.
    #[serde(default = "default_listen_addr")]
    pub addr: SocketAddr,

    /// Largest data frame accepted before the connection is dropped.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Suffix rules applied to every question name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuffixConfig {
    /// Names ending in any of these are not counted.
    #[serde(default = "default_ignore_suffixes")]
    pub ignore: Vec<String>,

    /// When non-empty, a name must carry every one of these to be counted.
    ///
    /// A suffix is carried when the name ends with it or, if the suffix ends
    /// in `.`, contains it as whole labels: `.prod.` admits
    /// `svc.prod.internal.`.
    #[serde(default)]
    pub only: Vec<String>,
}

impl Default for SuffixConfig {
    fn default() -> Self {
        Self {
            ignore: default_ignore_suffixes(),
            only: Vec::new(),
        }
    }
}

/// Pod registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Restrict the pod watch to one namespace. All namespaces when unset.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "kube_dnstap=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prometheus exposition.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics: MetricsConfig::default(),
            opentelemetry: None,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON inside a cluster, text elsewhere.
    #[default]
    Auto,
    /// Human readable text.
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Resolve `Auto` against the environment.
    pub fn resolve(self) -> LogFormat {
        match self {
            LogFormat::Auto if in_cluster() => LogFormat::Json,
            LogFormat::Auto => LogFormat::Text,
            other => other,
        }
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve the metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics HTTP listen address.
    #[serde(default = "default_metrics_addr")]
    pub addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_metrics_addr(),
        }
    }
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 12345))
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_frame_size() -> usize {
    256 * 1024
}

fn default_ignore_suffixes() -> Vec<String> {
    vec![".svc.cluster.local.".to_string(), ".cluster.local.".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "kube-dnstap".to_string()
}

fn default_true() -> bool {
    true
}

/// True when running inside a Kubernetes pod.
pub fn in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
}

/// Directories searched for `kube-dnstap.{toml,yaml,json}`.
pub(crate) fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(CONFIG_NAME));
    }
    dirs.push(PathBuf::from("/etc"));
    dirs
}

impl Config {
    /// Load configuration from `path` (or the search path) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CollectorError> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                for dir in search_dirs() {
                    let name = dir.join(CONFIG_NAME);
                    builder = builder.add_source(
                        config::File::with_name(&name.to_string_lossy()).required(false),
                    );
                }
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("suffixes.ignore")
                    .with_list_parse_key("suffixes.only"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the collector cannot run with.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.listen.max_frame_size == 0 {
            return Err(CollectorError::InvalidConfig(
                "listen.max_frame_size must be greater than zero".to_string(),
            ));
        }

        let mut suffixes = self.suffixes.ignore.iter().chain(&self.suffixes.only);
        if suffixes.any(|s| s.is_empty()) {
            return Err(CollectorError::InvalidConfig(
                "suffix rules must not contain empty strings".to_string(),
            ));
        }

        Ok(())
    }

    /// Non-fatal problems worth logging once telemetry is up.
    pub fn warnings(&self) -> Vec<String> {
        self.suffixes
            .ignore
            .iter()
            .map(|s| ("suffixes.ignore", s))
            .chain(self.suffixes.only.iter().map(|s| ("suffixes.only", s)))
            .filter(|(_, s)| !s.ends_with('.'))
            .map(|(key, s)| {
                format!("{key} entry {s:?} has no trailing dot and will never match a query name")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen.addr, "0.0.0.0:12345".parse().unwrap());
        assert_eq!(config.telemetry.metrics.addr, "0.0.0.0:8080".parse().unwrap());
        assert!(config.telemetry.metrics.enabled);
        assert_eq!(
            config.suffixes.ignore,
            vec![".svc.cluster.local.", ".cluster.local."]
        );
        assert!(config.suffixes.only.is_empty());
        assert!(!config.quiet);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
quiet = true

[listen]
addr = "127.0.0.1:6000"

[suffixes]
ignore = [".local."]
only = [".prod.", ".internal."]

[telemetry]
log_format = "json"

[telemetry.metrics]
enabled = false
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert!(config.quiet);
        assert_eq!(config.listen.addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.listen.max_frame_size, 256 * 1024);
        assert_eq!(config.suffixes.ignore, vec![".local."]);
        assert_eq!(config.suffixes.only, vec![".prod.", ".internal."]);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert!(!config.telemetry.metrics.enabled);
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let file = write_config(
            r#"
[listen]
max_frame_size = 4096
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.listen.addr, "0.0.0.0:12345".parse().unwrap());
        assert_eq!(config.listen.max_frame_size, 4096);
        assert_eq!(config.suffixes.ignore.len(), 2);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/kube-dnstap.toml")));
        assert!(matches!(result, Err(CollectorError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_suffix() {
        let mut config = Config::default();
        config.suffixes.only = vec![String::new()];
        assert!(matches!(
            config.validate(),
            Err(CollectorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_frame_size() {
        let mut config = Config::default();
        config.listen.max_frame_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warns_on_suffix_without_trailing_dot() {
        let mut config = Config::default();
        config.suffixes.ignore = vec![".cluster.local".to_string(), ".svc.".to_string()];
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(".cluster.local"));
    }

    #[test]
    fn test_explicit_log_format_is_not_resolved() {
        assert_eq!(LogFormat::Text.resolve(), LogFormat::Text);
        assert_eq!(LogFormat::Json.resolve(), LogFormat::Json);
    }
}
