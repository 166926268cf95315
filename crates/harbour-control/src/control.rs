//! Control plane wiring.

use std::sync::Arc;

use tracing::{error, info};

use crate::agent::{create_agent_client, AgentClient, JobDispatcher};
use crate::bench::BenchManager;
use crate::config::{ControlConfig, DatabaseConfig};
use crate::domain::DomainResolver;
use crate::error::ControlResult;
use crate::registry::{CapacityPolicy, CapacityRegistry, FixedCapacity};
use crate::release::ReleasePipeline;
use crate::site::SiteManager;
use crate::store::{ControlStore, MemoryStore, PostgresStore};
use crate::types::{ServerId, TargetKind};

/// Every control-plane component, sharing one store and one dispatcher.
///
/// The dispatcher holds the owning components only weakly; dropping the
/// control plane drops them.
pub struct ControlPlane {
    store: Arc<dyn ControlStore>,
    registry: Arc<CapacityRegistry>,
    dispatcher: Arc<JobDispatcher>,
    releases: Arc<ReleasePipeline>,
    benches: Arc<BenchManager>,
    sites: Arc<SiteManager>,
    domains: DomainResolver,
}

impl ControlPlane {
    /// Build a control plane with a fixed per-server bench limit from
    /// configuration.
    pub fn new(
        config: &ControlConfig,
        store: Arc<dyn ControlStore>,
        client: Arc<dyn AgentClient>,
    ) -> ControlResult<Self> {
        let policy = Arc::new(FixedCapacity::new(config.capacity.max_benches_per_server));
        Self::with_policy(config, store, client, policy)
    }

    /// Build a control plane with a custom capacity policy.
    pub fn with_policy(
        config: &ControlConfig,
        store: Arc<dyn ControlStore>,
        client: Arc<dyn AgentClient>,
        policy: Arc<dyn CapacityPolicy>,
    ) -> ControlResult<Self> {
        let registry = Arc::new(CapacityRegistry::new(Arc::clone(&store), policy));
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            client,
            config.agent.job_timeout(),
            config.agent.poll_interval(),
        ));

        let releases = Arc::new(ReleasePipeline::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            config.release.builder_server.as_deref().map(ServerId::new),
        ));
        let benches = Arc::new(BenchManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        ));
        let sites = Arc::new(SiteManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            config.sites.root_domain.clone(),
        ));
        let domains = DomainResolver::new(Arc::clone(&store));

        dispatcher.register_handler(TargetKind::DeployCandidate, &releases)?;
        dispatcher.register_handler(TargetKind::Bench, &benches)?;
        dispatcher.register_handler(TargetKind::Site, &sites)?;

        Ok(Self {
            store,
            registry,
            dispatcher,
            releases,
            benches,
            sites,
            domains,
        })
    }

    /// Build a control plane from configuration alone, connecting to the
    /// database and creating the configured agent client.
    pub async fn from_config(config: &ControlConfig) -> ControlResult<Self> {
        let store = connect_store(&config.database).await?;
        let client = create_agent_client(&config.agent)?;
        info!(client = ?config.agent.client, "agent client configured");
        Self::new(config, store, client)
    }

    /// Shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ControlStore> {
        &self.store
    }

    /// Capacity registry.
    #[must_use]
    pub fn registry(&self) -> &CapacityRegistry {
        &self.registry
    }

    /// Agent job dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    /// Release pipeline.
    #[must_use]
    pub fn releases(&self) -> &ReleasePipeline {
        &self.releases
    }

    /// Bench manager.
    #[must_use]
    pub fn benches(&self) -> &BenchManager {
        &self.benches
    }

    /// Site manager.
    #[must_use]
    pub fn sites(&self) -> &SiteManager {
        &self.sites
    }

    /// Domain resolver.
    #[must_use]
    pub const fn domains(&self) -> &DomainResolver {
        &self.domains
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Connect to PostgreSQL, falling back to memory when allowed.
async fn connect_store(config: &DatabaseConfig) -> ControlResult<Arc<dyn ControlStore>> {
    match PostgresStore::new(&config.url, config.max_connections).await {
        Ok(store) => {
            info!(url = %config.url, "connected to PostgreSQL");
            Ok(Arc::new(store))
        }
        Err(e) if config.memory_fallback => {
            error!(error = %e, "failed to connect to PostgreSQL, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Err(e) => Err(e),
    }
}
