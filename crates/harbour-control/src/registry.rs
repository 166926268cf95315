//! Capacity registry for servers and proxy servers.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::naming::validate_hostname;
use crate::records::{ProxyServerRecord, ServerRecord};
use crate::store::ControlStore;
use crate::types::{HostStatus, ProxyServerId, ServerId};

const fn default_host_status() -> HostStatus {
    HostStatus::Active
}

/// Registration request for a proxy server.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyServerSpec {
    /// Hostname.
    pub name: ProxyServerId,
    /// Initial status.
    #[serde(default = "default_host_status")]
    pub status: HostStatus,
    /// Public address.
    #[serde(default)]
    pub ip: Option<String>,
    /// Private network address.
    #[serde(default)]
    pub private_ip: Option<String>,
}

/// Registration request for a server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    /// Hostname.
    pub name: ServerId,
    /// Initial status.
    #[serde(default = "default_host_status")]
    pub status: HostStatus,
    /// Public address.
    #[serde(default)]
    pub ip: Option<String>,
    /// Private network address.
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Proxy server fronting the host.
    pub proxy_server: ProxyServerId,
}

/// Decides how many benches a server may hold.
pub trait CapacityPolicy: Send + Sync + std::fmt::Debug {
    /// Maximum benches for the server; `None` means unlimited.
    fn max_benches(&self, server: &ServerRecord) -> Option<u32>;
}

/// The same bench limit for every server.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCapacity {
    limit: Option<u32>,
}

impl FixedCapacity {
    /// Create a policy with the given limit.
    #[must_use]
    pub const fn new(limit: Option<u32>) -> Self {
        Self { limit }
    }
}

impl CapacityPolicy for FixedCapacity {
    fn max_benches(&self, _server: &ServerRecord) -> Option<u32> {
        self.limit
    }
}

/// Registry of compute and proxy hosts.
pub struct CapacityRegistry {
    store: Arc<dyn ControlStore>,
    policy: Arc<dyn CapacityPolicy>,
}

impl CapacityRegistry {
    /// Create a new registry.
    pub fn new(store: Arc<dyn ControlStore>, policy: Arc<dyn CapacityPolicy>) -> Self {
        Self { store, policy }
    }

    /// Register a proxy server, returning the existing record on a repeat.
    pub async fn register_proxy_server(
        &self,
        spec: ProxyServerSpec,
    ) -> ControlResult<ProxyServerRecord> {
        validate_hostname(spec.name.as_str())?;

        let now = Utc::now();
        let record = ProxyServerRecord {
            name: spec.name,
            status: spec.status,
            ip: spec.ip,
            private_ip: spec.private_ip,
            reachable: false,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.upsert_proxy_server(&record).await?;
        info!(proxy = %stored.name, status = %stored.status, "proxy server registered");
        Ok(stored)
    }

    /// Register a server, returning the existing record on a repeat.
    pub async fn register_server(&self, spec: ServerSpec) -> ControlResult<ServerRecord> {
        validate_hostname(spec.name.as_str())?;

        if self.store.get_proxy_server(&spec.proxy_server).await?.is_none() {
            return Err(ControlError::validation(format!(
                "unknown proxy server: {}",
                spec.proxy_server
            )));
        }

        let now = Utc::now();
        let record = ServerRecord {
            name: spec.name,
            status: spec.status,
            ip: spec.ip,
            private_ip: spec.private_ip,
            proxy_server: spec.proxy_server,
            reachable: false,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.upsert_server(&record).await?;
        info!(
            server = %stored.name,
            proxy = %stored.proxy_server,
            status = %stored.status,
            "server registered"
        );
        Ok(stored)
    }

    /// Activate or deactivate a server.
    pub async fn set_server_status(&self, id: &ServerId, status: HostStatus) -> ControlResult<()> {
        self.store.set_server_status(id, status).await?;
        info!(server = %id, %status, "server status changed");
        Ok(())
    }

    /// Activate or deactivate a proxy server.
    pub async fn set_proxy_status(
        &self,
        id: &ProxyServerId,
        status: HostStatus,
    ) -> ControlResult<()> {
        self.store.set_proxy_status(id, status).await?;
        info!(proxy = %id, %status, "proxy server status changed");
        Ok(())
    }

    /// Record whether a host answered.
    pub async fn record_reachability(&self, host: &str, reachable: bool) -> ControlResult<()> {
        if !self
            .store
            .record_reachability(host, reachable, Utc::now())
            .await?
        {
            debug!(host, "reachability reported for unknown host");
        }
        Ok(())
    }

    /// Get a server.
    pub async fn server(&self, id: &ServerId) -> ControlResult<ServerRecord> {
        self.store
            .get_server(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Server, id))
    }

    /// Get a proxy server.
    pub async fn proxy_server(&self, id: &ProxyServerId) -> ControlResult<ProxyServerRecord> {
        self.store
            .get_proxy_server(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ProxyServer, id))
    }

    /// List servers.
    pub async fn servers(&self) -> ControlResult<Vec<ServerRecord>> {
        self.store.list_servers().await
    }

    /// Get a server that must be active.
    pub async fn require_active_server(&self, id: &ServerId) -> ControlResult<ServerRecord> {
        let server = self.server(id).await?;
        if server.status != HostStatus::Active {
            return Err(ControlError::not_ready(
                EntityKind::Server,
                id,
                server.status,
                HostStatus::Active.as_str(),
            ));
        }
        Ok(server)
    }

    /// Bench limit for a server under the configured policy.
    #[must_use]
    pub fn bench_limit(&self, server: &ServerRecord) -> Option<u32> {
        self.policy.max_benches(server)
    }

    /// Network address of a host's agent.
    ///
    /// The public IP when one is recorded, the hostname otherwise.
    pub async fn agent_address(&self, host: &str) -> ControlResult<String> {
        if let Some(server) = self.store.get_server(&ServerId::new(host)).await? {
            return Ok(server.ip.unwrap_or(server.name.to_string()));
        }
        if let Some(proxy) = self.store.get_proxy_server(&ProxyServerId::new(host)).await? {
            return Ok(proxy.ip.unwrap_or(proxy.name.to_string()));
        }
        Err(ControlError::not_found(EntityKind::Server, host))
    }
}

impl std::fmt::Debug for CapacityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityRegistry")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
