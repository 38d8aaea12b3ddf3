//! corral master
//!
//! Serves the scheduler and operator APIs and owns cluster state for the
//! lifetime of the process.

use std::sync::Arc;

use anyhow::Result;
use corral_master::{
    allocator::LocalAllocator,
    api,
    authz::{Authorizer, LocalAuthorizer},
    config,
    messenger::LocalMessenger,
    registry::InMemoryRegistry,
    Collaborators,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CORRAL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral master");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let authorizer: Option<Arc<dyn Authorizer>> = match &config.acls {
        Some(path) => match LocalAuthorizer::from_file(path, config.authz_permissive) {
            Ok(authorizer) => {
                info!(acls = %path.display(), "Loaded ACLs");
                Some(Arc::new(authorizer))
            }
            Err(e) => {
                error!(error = %e, "Failed to load ACLs");
                return Err(e.into());
            }
        },
        None => {
            warn!("No ACLs configured; every action is approved");
            None
        }
    };

    let collaborators = Collaborators {
        registry: Arc::new(InMemoryRegistry::new()),
        allocator: Arc::new(LocalAllocator::new()),
        messenger: Arc::new(LocalMessenger::new()),
        authorizer,
    };

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (master, master_task) =
        corral_master::start(collaborators, config.master_options(), shutdown_rx.clone());

    let app = api::create_router(master);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    let mut exit = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = master_task => {
            // The master only stops on its own after a fatal error.
            match result {
                Ok(Ok(())) => info!("Master exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Master failed");
                    exit = Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "Master task panicked");
                    exit = Err(e.into());
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Server error"),
        Ok(Err(e)) => error!(error = %e, "Server task panicked"),
        Err(_) => warn!("HTTP server did not shut down in time"),
    }

    info!("Master shutdown complete");
    exit
}
