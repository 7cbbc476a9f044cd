//! Runtime configuration reload.
//!
//! A [`ConfigReloader`] re-reads the configuration whenever it receives a
//! [`ReloadTrigger`] and publishes the resulting [`Settings`] to the
//! pipeline. Triggers come from a filesystem watcher started with
//! [`watch_config`] and from SIGHUP, forwarded by the binary.
//!
//! The watcher observes directories rather than files. A ConfigMap mounted
//! into a pod is updated by atomically swapping a `..data` symlink, which a
//! watch on the file itself never reports.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{search_dirs, Config, CONFIG_NAME};
use crate::error::CollectorError;
use crate::pipeline::Settings;

/// Quiet period after a file event before the configuration is re-read.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// Why a reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// SIGHUP was received.
    Hangup,
    /// A configuration file changed on disk.
    FileChanged,
}

/// Re-reads configuration and republishes the runtime settings.
pub struct ConfigReloader {
    path: Option<PathBuf>,
    current: Config,
    settings: watch::Sender<Settings>,
}

impl ConfigReloader {
    /// `path` is the explicit `--config` file, if any. `current` is the
    /// configuration the process started with.
    pub fn new(path: Option<PathBuf>, current: Config, settings: watch::Sender<Settings>) -> Self {
        Self {
            path,
            current,
            settings,
        }
    }

    /// Load the configuration again and publish its settings.
    ///
    /// Returns whether the published settings changed. On error nothing is
    /// published.
    pub fn reload(&mut self) -> Result<bool, CollectorError> {
        let reloaded = Config::load(self.path.as_deref())?;

        for warning in reloaded.warnings() {
            warn!("{}", warning);
        }
        if reloaded.listen.addr != self.current.listen.addr
            || reloaded.telemetry.metrics.addr != self.current.telemetry.metrics.addr
        {
            warn!("listen addresses changed; a restart is required to rebind");
        }

        let next = Settings::from(&reloaded);
        let changed = self.settings.send_if_modified(|published| {
            if *published == next {
                false
            } else {
                *published = next.clone();
                true
            }
        });

        if changed {
            info!(
                ignore = ?reloaded.suffixes.ignore,
                only = ?reloaded.suffixes.only,
                quiet = reloaded.quiet,
                "configuration reloaded"
            );
        } else {
            debug!("configuration reloaded without changes");
        }
        self.current = reloaded;
        Ok(changed)
    }

    /// Reload on every trigger until shutdown or until every trigger source
    /// is gone. File events are debounced; a burst yields one reload.
    pub async fn run(
        mut self,
        mut triggers: mpsc::UnboundedReceiver<ReloadTrigger>,
        shutdown: CancellationToken,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => return,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => return,
                },
            };

            if trigger == ReloadTrigger::FileChanged {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(DEBOUNCE) => {}
                }
            }
            while triggers.try_recv().is_ok() {}

            debug!(?trigger, "reloading configuration");
            if let Err(e) = self.reload() {
                warn!(error = %e, "configuration reload failed; keeping previous settings");
            }
        }
    }
}

/// Start watching the configuration for changes. Relevant events are sent
/// as [`ReloadTrigger::FileChanged`]; the watch stops when the returned
/// watcher is dropped.
///
/// With an explicit `path` its parent directory is watched. Otherwise every
/// existing directory on the search path is.
pub fn watch_config(
    path: Option<&Path>,
    triggers: mpsc::UnboundedSender<ReloadTrigger>,
) -> Result<RecommendedWatcher, CollectorError> {
    let target = path.map(Path::to_path_buf);
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| match event {
        Ok(event) if is_config_event(target.as_deref(), &event) => {
            let _ = triggers.send(ReloadTrigger::FileChanged);
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "configuration watch error"),
    })?;

    for dir in watched_dirs(path) {
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "watching for configuration changes");
    }
    Ok(watcher)
}

/// Directories whose entries can change the loaded configuration.
pub fn watched_dirs(path: Option<&Path>) -> Vec<PathBuf> {
    match path {
        Some(path) => {
            let parent = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            vec![parent.to_path_buf()]
        }
        None => search_dirs().into_iter().filter(|dir| dir.is_dir()).collect(),
    }
}

/// True when `event` touches the configuration file or a Kubernetes
/// atomic-writer entry beside it.
fn is_config_event(target: Option<&Path>, event: &Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|changed| {
        let Some(name) = changed.file_name() else {
            return false;
        };
        if name.to_string_lossy().starts_with("..") {
            return true;
        }
        match target {
            Some(target) => target.file_name() == Some(name),
            None => Path::new(name).file_stem() == Some(OsStr::new(CONFIG_NAME)),
        }
    })
}
