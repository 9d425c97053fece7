mod config;
mod lock;
mod report;
mod store;
mod vcs;
mod watch;

use std::sync::Arc;

use anyhow::{anyhow, Context};
use autoshelve_core::memory::StaticContext;
use autoshelve_core::{AutoShelve, HostController};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use config::Config;
use store::LocalShelvesetStore;
use vcs::GitBackend;
use watch::OptionsWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let options = config.engine_config()?;

    let dir = config.effective_store_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating store dir {}", dir.display()))?;
    let dir = dir.canonicalize()?;
    let store_uri = Url::from_directory_path(&dir)
        .map_err(|_| anyhow!("store dir {} is not an absolute path", dir.display()))?;
    let owner = config.effective_owner();

    info!("Starting autoshelve");
    info!("  Store: {}", dir.display());
    info!("  Owner: {}", owner);
    info!("  Pattern: {}", options.name_pattern);
    info!("  Interval: {} min", options.interval_minutes);
    for workspace in &config.workspaces {
        info!("  Workspace: {}", workspace.display());
    }
    if config.workspaces.is_empty() {
        warn!("No --workspace given, nothing will be shelved");
    }

    let backend = Arc::new(GitBackend::new(
        config.workspaces.clone(),
        owner,
        store_uri.clone(),
        LocalShelvesetStore::new(&dir),
    ));
    let host = Arc::new(StaticContext::new(store_uri.as_str()));
    let engine = AutoShelve::new(backend, host, options)?;
    let controller = Arc::new(HostController::new(engine.clone()));

    if config.once {
        return shelve_once(&controller).await;
    }

    let reporter = report::spawn_reporter(&engine);

    // Keep the watcher alive until shutdown
    let _options_watcher = match &config.options_file {
        Some(path) => Some(OptionsWatcher::spawn(
            path.clone(),
            config.clone(),
            controller.clone(),
        )?),
        None => None,
    };

    controller.solution_opened();
    spawn_debugger_signals(controller.clone())?;

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    if let Some(run) = controller.solution_closed().await {
        info!("Waiting for {} final shelve attempts", run.len());
        run.join().await;
    }
    controller.engine().stop();

    // Let the reporter flush what is already queued
    tokio::task::yield_now().await;
    reporter.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Shelve every workspace once and fail if any attempt failed.
async fn shelve_once(controller: &HostController) -> anyhow::Result<()> {
    let engine = controller.engine();
    let mut rx = engine.subscribe();

    controller.shelve_now().await.join().await;

    let mut failures = 0;
    while let Ok(event) = rx.try_recv() {
        report::log_event(&event, engine.maximum_shelvesets());
        if report::is_failure(&event) {
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} shelve attempts failed", failures);
    }
    Ok(())
}

/// SIGUSR1 and SIGUSR2 mark the start and end of a debugging session.
#[cfg(unix)]
fn spawn_debugger_signals(controller: Arc<HostController>) -> anyhow::Result<()> {
    use signal::unix::{signal as unix_signal, SignalKind};

    let mut run_mode = unix_signal(SignalKind::user_defined1())?;
    let mut design_mode = unix_signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = run_mode.recv() => {
                    info!("Received SIGUSR1, entering run mode");
                    controller.enter_run_mode();
                }
                Some(()) = design_mode.recv() => {
                    info!("Received SIGUSR2, entering design mode");
                    // The resume attempt reports through the event bus
                    let _ = controller.enter_design_mode().await;
                }
                else => break,
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_debugger_signals(_controller: Arc<HostController>) -> anyhow::Result<()> {
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
