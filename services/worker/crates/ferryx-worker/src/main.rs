//! ferryx worker entry point.
//!
//! Initialises tracing, loads configuration from `FERRYX_*` environment
//! variables, bootstraps the group's operation directory, joins the
//! coordinator's deploy hub and serves `/health` until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ferryx_worker::bootstrap::ensure_operation;
use ferryx_worker::config::{Settings, WorkerConfig};
use ferryx_worker::deploy::{DeployDispatcher, DeployHandler};
use ferryx_worker::health;
use ferryx_worker::hub::SignalRChannel;
use ferryx_worker::runner::TokioProcessRunner;
use ferryx_worker::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Ignore the error if another dependency installed a provider first.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // 1. Initialise tracing with RUST_LOG env filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("ferryx-worker starting");

    // 2. Load configuration from FERRYX_* env vars.
    let config = WorkerConfig::from_env().context("failed to load config from FERRYX_* env vars")?;
    let settings = Settings::from_config(config).context(
        "invalid worker configuration \
         (FERRYX_HUB_URL, FERRYX_HUB_TOKEN and FERRYX_GROUP are required)",
    )?;

    tracing::info!(
        hub_url        = %settings.hub.hub_url,
        group          = %settings.hub.group,
        listen_addr    = %settings.listen_addr,
        operation_root = %settings.operation_root.display(),
        shell          = %settings.shell,
        "configuration loaded",
    );

    // 3. Make sure the group's operation directory and template exist.
    let (layout, _) = ensure_operation(&settings.operation_root, &settings.hub.group)
        .context("failed to bootstrap operation directory")?;
    tracing::info!(template = %layout.template.display(), "operation template ready");

    // 4. Shutdown token shared by the session, the deploy tasks and the
    //    health server.
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    // 5. Wire channel → session → dispatcher.
    let token = settings.hub.token.clone();
    let channel = Arc::new(SignalRChannel::new(
        settings.hub.endpoint(),
        Arc::new(move || token.clone()),
    ));
    let dispatcher = Arc::new(DeployDispatcher::new(
        DeployHandler::new(
            settings.operation_root.clone(),
            settings.hub.group.clone(),
            settings.shell.clone(),
            TokioProcessRunner,
        ),
        shutdown.clone(),
    ));
    let session = SessionManager::new(channel, &settings.hub, dispatcher.clone());
    let session_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { session.run(shutdown).await }
    });

    // 6. Serve the health endpoint until shutdown.
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    tracing::info!(listen_addr = %settings.listen_addr, "health endpoint ready at /health");

    let served = axum::serve(listener, health::router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server error");

    // 7. Stop the session and let in-flight deploys clean up.
    shutdown.cancel();
    if let Err(e) = session_task.await {
        tracing::warn!(error = %e, "session task ended abnormally");
    }
    if dispatcher.in_flight() > 0 {
        tracing::info!(in_flight = dispatcher.in_flight(), "waiting for deploy tasks");
    }
    dispatcher.drain().await;

    served?;
    tracing::info!("ferryx-worker shut down");
    Ok(())
}

/// Cancels `shutdown` on SIGINT (Ctrl-C) or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
        () = shutdown.cancelled() => return,
    }
    tracing::info!("received shutdown signal");
    shutdown.cancel();
}
