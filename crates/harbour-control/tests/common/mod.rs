//! Common test utilities for control plane integration tests.

#![allow(dead_code, clippy::unwrap_used)]

pub mod fixtures;

use std::sync::Arc;

use chrono::{Duration, Utc};
use harbour_control::agent::ReconcileReport;
use harbour_control::api::AppState;
use harbour_control::config::ControlConfig;
use harbour_control::{ControlPlane, ControlStore, MemoryStore, MockAgentClient};

/// Root domain every test site lives under.
pub const ROOT_DOMAIN: &str = "harbour.test";

/// Proxy server registered by [`TestPlane::with_hosts`].
pub const PROXY: &str = "n1.harbour.test";

/// Server registered by [`TestPlane::with_hosts`]; also the builder.
pub const SERVER: &str = "f1.harbour.test";

/// Complete test control plane with a mock agent and in-memory store.
pub struct TestPlane {
    pub plane: Arc<ControlPlane>,
    pub store: Arc<dyn ControlStore>,
    pub agent: Arc<MockAgentClient>,
}

impl TestPlane {
    /// Creates a control plane with no bench limit and no hosts.
    pub fn new() -> Self {
        Self::with_config(Self::config(None))
    }

    /// Creates a control plane whose servers hold at most `limit` benches.
    pub fn with_bench_limit(limit: u32) -> Self {
        Self::with_config(Self::config(Some(limit)))
    }

    /// Creates a control plane from custom configuration.
    pub fn with_config(config: ControlConfig) -> Self {
        let store: Arc<dyn ControlStore> = Arc::new(MemoryStore::new());
        let agent = Arc::new(MockAgentClient::new());
        let plane = ControlPlane::new(&config, Arc::clone(&store), agent.clone()).unwrap();

        Self {
            plane: Arc::new(plane),
            store,
            agent,
        }
    }

    /// Creates a control plane with the default proxy and server registered.
    pub async fn with_hosts() -> Self {
        let plane = Self::new();
        fixtures::register_hosts(&plane).await;
        plane
    }

    /// Configuration used by the test harness.
    pub fn config(max_benches: Option<u32>) -> ControlConfig {
        let mut config = ControlConfig::default();
        config.release.builder_server = Some(SERVER.to_owned());
        config.capacity.max_benches_per_server = max_benches;
        config.sites.root_domain = ROOT_DOMAIN.to_owned();
        config
    }

    /// Runs one reconciliation pass now.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.plane
            .dispatcher()
            .reconcile_at(Utc::now())
            .await
            .unwrap()
    }

    /// Runs one reconciliation pass after every open job's deadline.
    pub async fn reconcile_after_deadlines(&self) -> ReconcileReport {
        self.plane
            .dispatcher()
            .reconcile_at(Utc::now() + Duration::days(1))
            .await
            .unwrap()
    }

    /// HTTP state sharing this control plane.
    pub fn app_state(&self) -> AppState {
        AppState {
            plane: Arc::clone(&self.plane),
        }
    }
}

impl Default for TestPlane {
    fn default() -> Self {
        Self::new()
    }
}
