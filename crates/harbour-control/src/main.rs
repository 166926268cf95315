//! Harbour control service binary.
//!
//! Runs the control plane for provisioning and operating hosted sites.

use tracing::info;
use tracing_subscriber::EnvFilter;

use harbour_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("harbour_control=info".parse()?),
        )
        .init();

    info!("Harbour control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen = %config.server.listen,
        database = %config.database.url,
        agent_client = ?config.agent.client,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;
    Ok(())
}
