//! codelab-lsp-gateway: WebSocket ↔ LSP gateway for browser code editors.
//!
//! Architecture:
//! ```text
//! browser editor <-WS (JSON-RPC)-> gateway <-LSP (child stdio)-> jdtls / pylsp
//! ```
//!
//! One session per connection: own workspace directory, own language-server
//! process, deterministic teardown on disconnect or signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use codelab_lsp_gateway::config::Config;
use codelab_lsp_gateway::registry::SessionRegistry;
use codelab_lsp_gateway::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Startup failures (missing java, launcher jar, config dir) are fatal and
    // exit nonzero before the listener opens.
    let config = Arc::new(Config::from_env().context("invalid gateway configuration")?);
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        "gateway configuration loaded"
    );

    let registry = Arc::new(SessionRegistry::new());
    let state = AppState {
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives, after draining every live
/// session. The signal handlers themselves only wake this task; all teardown
/// I/O runs on the runtime.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!("SIGINT received"),
        () = terminate => tracing::info!("SIGTERM received"),
    }

    registry.shutdown_all().await;
}
