//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::config::ControlConfig;
use crate::control::ControlPlane;
use crate::error::{ControlError, ControlResult};

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Database connection and agent client
/// - The agent job reconciler
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service until shutdown.
    pub async fn run(&self) -> ControlResult<()> {
        let plane = Arc::new(ControlPlane::from_config(&self.config).await?);
        info!(
            root_domain = %self.config.sites.root_domain,
            builder = ?self.config.release.builder_server,
            "control plane initialised"
        );

        let dispatcher = Arc::clone(plane.dispatcher());
        let reconciler_cancel = self.cancel.child_token();
        let reconciler = tokio::spawn(async move { dispatcher.run(reconciler_cancel).await });

        let app = api::router(api::AppState { plane });

        let listener = tokio::net::TcpListener::bind(self.config.server.listen)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;
        info!(listen = %self.config.server.listen, "control service listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| ControlError::Config(format!("server error: {e}")));

        self.cancel.cancel();
        if let Err(e) = reconciler.await {
            error!(error = %e, "job reconciler task failed");
        }

        served?;
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creation() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        assert!(!service.cancel.is_cancelled());
    }

    #[test]
    fn service_shutdown() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }
}
