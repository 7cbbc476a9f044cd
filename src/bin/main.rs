//! kube-dnstap binary entry point.

use clap::Parser;
use kube_dnstap::reload::watch_config;
use kube_dnstap::{
    telemetry, Collector, Config, ConfigReloader, KubePodSource, ReloadTrigger, Settings,
    TelemetrySink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-workload DNS query telemetry from dnstap.
#[derive(Parser, Debug)]
#[command(name = "kube-dnstap")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, YAML or JSON). Searched for in
    /// `.`, `$HOME/kube-dnstap` and `/etc` when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load and validate the configuration, print it and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    if args.check_config {
        println!("{config:#?}");
        for warning in config.warnings() {
            println!("warning: {warning}");
        }
        return Ok(());
    }

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    for warning in config.warnings() {
        warn!("{}", warning);
    }

    info!(
        config_file = ?args.config,
        listen_addr = %config.listen.addr,
        ignore = ?config.suffixes.ignore,
        only = ?config.suffixes.only,
        quiet = config.quiet,
        "Starting kube-dnstap"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let (settings_tx, settings_rx) = watch::channel(Settings::from(&config));
    let (trigger_tx, triggers) = mpsc::unbounded_channel();
    // Dropping the watcher stops file notifications.
    let _watcher = match watch_config(args.config.as_deref(), trigger_tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "cannot watch configuration; reload on SIGHUP only");
            None
        }
    };
    tokio::spawn(forward_hangups(trigger_tx, shutdown.clone()));
    tokio::spawn(
        ConfigReloader::new(args.config.clone(), config.clone(), settings_tx)
            .run(triggers, shutdown.clone()),
    );

    let result = match KubePodSource::try_default(&config.kubernetes).await {
        Ok(source) => {
            let collector = Collector::new(config.listen, settings_rx, Arc::new(TelemetrySink));
            collector.run(source, shutdown).await
        }
        Err(e) => Err(e),
    };

    // Shutdown telemetry
    telemetry::shutdown();

    if let Err(e) = result {
        error!("kube-dnstap error: {}", e);
        return Err(e.into());
    }

    info!("kube-dnstap shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Request a configuration reload on every SIGHUP.
async fn forward_hangups(
    triggers: mpsc::UnboundedSender<ReloadTrigger>,
    shutdown: CancellationToken,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() || triggers.send(ReloadTrigger::Hangup).is_err() {
                    return;
                }
            }
        }
    }
}
