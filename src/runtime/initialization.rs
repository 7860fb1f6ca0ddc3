//! # Initialization
//!
//! Controller initialization: rustls setup, tracing, metrics, state loading,
//! server startup, the initial rules file load and the Kubernetes watchers.

use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::generator::GeneratorEngine;
use crate::controller::reconciler::{Reconciler, ReconcilerConfig, ReconcilerHandle};
use crate::controller::state::StateStore;
use crate::observability;
use crate::provider::ClientOptions;
use crate::runtime::health::run_health_checks;
use crate::runtime::rules_reload::{run_rules_reload, RulesFileLoader};
use crate::runtime::server::{start_server, ServerState};
use crate::runtime::status_writer::run_status_writer;
use crate::runtime::watchers::{spawn_watchers, ResourceIndex};
use crate::secret::{install_digest_key, DigestKey};

/// Everything started by [`initialize`]
pub struct InitializationResult {
    pub controller_config: ControllerConfig,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    /// Workers and scheduler
    pub reconciler_handle: ReconcilerHandle,
    /// Server, watchers, persister, status writer, health checks, rules reload
    pub background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field(
                "server_ready",
                &self.server_state.is_ready.load(std::sync::atomic::Ordering::Relaxed),
            )
            .field("background_tasks", &self.background.len())
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - Digest key loading, then sync state loading and persistence
/// - HTTP server startup
/// - The initial rules file load (an invalid file fails startup)
/// - Kubernetes client creation and watchers
/// - Worker pool, scheduler, status writer and store health checks
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before any client that uses rustls is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    observability::logging::init();

    info!("Starting Push Secret Controller v{}", env!("CARGO_PKG_VERSION"));

    observability::metrics::register_metrics()?;

    let controller_config = ControllerConfig::from_env();
    let server_config = ServerConfig::from_env();
    info!("Controller configuration: {:?}", controller_config);

    if let Some(path) = controller_config.digest_key_path() {
        let key = DigestKey::load_or_create(&path)
            .with_context(|| format!("Failed to load digest key {}", path.display()))?;
        install_digest_key(key);
    }

    let state = match &controller_config.state_file {
        Some(path) => StateStore::load(path)
            .with_context(|| format!("Failed to load state file {}", path.display()))?,
        None => StateStore::new(),
    };
    let mut background = Vec::new();
    if let Some(path) = &controller_config.state_file {
        background.push(state.spawn_persister(path.clone()));
    }

    let reconciler = Reconciler::new(
        ReconcilerConfig::from(&controller_config),
        state,
        GeneratorEngine::new(),
    );

    let server_state = Arc::new(ServerState::new(
        Arc::clone(&reconciler),
        server_config.admin_token.clone(),
    ));
    let server_port = server_config.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;
    background.push(server_handle);

    let index = ResourceIndex::default();
    let options = ClientOptions {
        request_timeout: controller_config.backend_timeout,
        refresh_margin: controller_config.token_refresh_margin,
    };
    if let Some(path) = &controller_config.rules_file {
        let mut loader = RulesFileLoader::new(path.clone(), controller_config.default_max_retries, options);
        loader
            .reload(&reconciler, &index)
            .await
            .context("Initial rules file load failed")?;
        background.push(tokio::spawn(run_rules_reload(
            loader,
            Arc::clone(&reconciler),
            index.clone(),
            controller_config.rules_file_poll,
        )));
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    background.extend(spawn_watchers(
        client.clone(),
        Arc::clone(&reconciler),
        &controller_config,
        index.clone(),
    ));
    background.push(tokio::spawn(run_status_writer(
        client,
        reconciler.state().subscribe(),
        index,
    )));
    background.push(tokio::spawn(run_health_checks(
        Arc::clone(&reconciler),
        controller_config.health_check_interval,
    )));

    let reconciler_handle = reconciler.start();

    info!("Controller initialized");

    Ok(InitializationResult {
        controller_config,
        reconciler,
        server_state,
        reconciler_handle,
        background,
    })
}

/// Wait for the HTTP server to bind its port
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state
            .is_listening
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is accepting connections");
            break;
        }

        if start_time.elapsed() > server_config.startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to start within {} seconds",
                server_config.startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(server_config.poll_interval).await;
    }

    Ok(())
}
