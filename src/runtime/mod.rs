//! # Runtime
//!
//! Wiring of the controller process: initialization, Kubernetes watchers,
//! the HTTP server, status and health reporting, and shutdown.

pub mod health;
pub mod initialization;
pub mod rules_reload;
pub mod server;
pub mod status_writer;
pub mod watchers;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::controller::state::write_state_file;

/// Run the controller until SIGINT/SIGTERM
///
/// # Errors
/// Returns an error when initialization fails or the final state flush fails.
pub async fn run() -> Result<()> {
    let init = initialization::initialize().await?;
    init.server_state.set_ready(true);
    info!("Controller ready");

    shutdown_signal().await;
    info!("Received shutdown signal, shutting down...");
    init.server_state.set_ready(false);

    init.reconciler_handle.shutdown();
    for task in &init.background {
        task.abort();
    }

    if let Some(path) = &init.controller_config.state_file {
        let snapshot = init.reconciler.state().snapshot();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_state_file(&target, &snapshot))
            .await
            .context("State flush task failed")?
            .with_context(|| format!("Failed to flush state file {}", path.display()))?;
        info!("Flushed sync state to {}", path.display());
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
