//! Site state machine.
//!
//! Sites are created on an active bench and then moved through their
//! lifecycle by agent jobs. Each site owns a single lifecycle slot: the
//! `active_job` on its record. A job claims the slot with an atomic
//! compare-and-set in the store and releases it when its outcome arrives,
//! so at most one lifecycle change is ever in flight per site. A second
//! request while the slot is held is rejected, never queued.

pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::agent::{JobCompletionHandler, JobDispatcher, JobOutcome, JobRequest};
use crate::error::{ControlError, ControlResult, EntityKind};
use crate::naming::validate_subdomain;
use crate::records::{AgentJobRecord, PlanRecord, SiteData, SiteRecord};
use crate::registry::CapacityRegistry;
use crate::store::{ensure_bench_accepts_sites, Claim, ControlStore, SiteFilter};
use crate::types::{AppId, BenchId, JobTarget, JobType, PlanId, ServerId, SiteId, SiteStatus};

pub use state::{AnySite, SiteAction, SiteState};

use state::{Pending, Site};

/// Request to create a site.
#[derive(Clone, Deserialize)]
pub struct SiteRequest {
    /// DNS label under the root domain.
    pub subdomain: String,
    /// Server hosting the bench.
    pub server: ServerId,
    /// Bench to install on.
    pub bench: BenchId,
    /// Pricing plan.
    pub plan: PlanId,
    /// Apps to install, in order.
    pub apps: Vec<AppId>,
    /// Initial administrator password. Handed to the agent only.
    pub admin_password: String,
}

impl std::fmt::Debug for SiteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRequest")
            .field("subdomain", &self.subdomain)
            .field("server", &self.server)
            .field("bench", &self.bench)
            .field("plan", &self.plan)
            .field("apps", &self.apps)
            .finish_non_exhaustive()
    }
}

/// Definition of a pricing plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSpec {
    /// Plan name.
    pub name: PlanId,
    /// Price in US dollars.
    pub price_usd: f64,
    /// Price in Indian rupees.
    pub price_inr: f64,
    /// Billing period in days.
    pub period: u32,
}

/// Creates sites and drives their lifecycle.
pub struct SiteManager {
    store: Arc<dyn ControlStore>,
    registry: Arc<CapacityRegistry>,
    dispatcher: Arc<JobDispatcher>,
    root_domain: String,
}

impl SiteManager {
    /// Create a new site manager.
    ///
    /// Site names are `<subdomain>.<root_domain>`.
    pub fn new(
        store: Arc<dyn ControlStore>,
        registry: Arc<CapacityRegistry>,
        dispatcher: Arc<JobDispatcher>,
        root_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            root_domain: root_domain.into(),
        }
    }

    /// Store a plan, returning the existing record on a repeat.
    pub async fn upsert_plan(&self, spec: PlanSpec) -> ControlResult<PlanRecord> {
        if spec.name.as_str().is_empty() {
            return Err(ControlError::validation("plan name cannot be empty"));
        }
        let valid_price = |p: f64| p.is_finite() && p >= 0.0;
        if !valid_price(spec.price_usd) || !valid_price(spec.price_inr) {
            return Err(ControlError::validation(format!(
                "plan {} has a negative or non-finite price",
                spec.name
            )));
        }
        if spec.period == 0 {
            return Err(ControlError::validation(format!(
                "plan {} needs a billing period of at least one day",
                spec.name
            )));
        }

        let record = PlanRecord {
            name: spec.name,
            price_usd: spec.price_usd,
            price_inr: spec.price_inr,
            period: spec.period,
            created_at: Utc::now(),
        };
        self.store.upsert_plan(&record).await
    }

    /// Create a site and start installing it.
    ///
    /// Every precondition is checked before the site record exists. The
    /// site is returned pending; it moves to installing once the agent
    /// accepts the job and to active when the install succeeds.
    pub async fn create_site(&self, request: SiteRequest) -> ControlResult<SiteRecord> {
        validate_subdomain(&request.subdomain)?;
        let name = SiteId::new(format!("{}.{}", request.subdomain, self.root_domain));

        if self.store.get_site(&name).await?.is_some() {
            return Err(ControlError::validation(format!(
                "site name {name} is taken"
            )));
        }
        if request.admin_password.is_empty() {
            return Err(ControlError::validation("admin password cannot be empty"));
        }
        if request.apps.is_empty() {
            return Err(ControlError::validation("a site needs at least one app"));
        }

        let plan = self
            .store
            .get_plan(&request.plan)
            .await?
            .ok_or_else(|| {
                ControlError::validation(format!("unknown plan: {}", request.plan))
            })?;

        let server = self.registry.require_active_server(&request.server).await?;

        let bench = self
            .store
            .get_bench(&request.bench)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, &request.bench))?;
        if bench.server != server.name {
            return Err(ControlError::validation(format!(
                "bench {} is on {}, not {}",
                bench.name, bench.server, server.name
            )));
        }
        ensure_bench_accepts_sites(&bench)?;

        let candidate = self
            .store
            .get_candidate(&bench.candidate)
            .await?
            .ok_or_else(|| {
                ControlError::invariant(format!(
                    "bench {} references missing candidate {}",
                    bench.name, bench.candidate
                ))
            })?;
        if let Some(app) = request.apps.iter().find(|app| !candidate.contains_app(app)) {
            return Err(ControlError::validation(format!(
                "app {app} is not part of release group {}",
                bench.group
            )));
        }

        let job = JobRequest::new(
            JobType::NewSite,
            JobTarget::Site(name.clone()),
            server.name.as_str(),
            format!("benches/{}/sites", bench.name),
        )
        .with_payload(serde_json::json!({
            "name": name,
            "apps": request.apps,
            "plan": plan.name,
            "config": {
                "bench": bench.name,
                "workers": bench.workers,
            },
        }))
        .with_secret("admin_password", request.admin_password);

        let now = Utc::now();
        let site = Site::<Pending>::create(SiteData {
            name: name.clone(),
            subdomain: request.subdomain,
            bench: bench.name.clone(),
            server: server.name.clone(),
            plan: plan.name,
            apps: request.apps,
            active_job: Some(job.id.clone()),
            error: None,
            created_at: now,
            updated_at: now,
        });
        self.store.insert_site(&site.into_record()).await?;

        info!(
            site = %name,
            bench = %bench.name,
            server = %server.name,
            job_id = %job.id,
            "site creation started"
        );

        self.dispatch(&name, job).await?;
        self.site(&name).await
    }

    /// Start a lifecycle action.
    ///
    /// Rejected with a state conflict while another job holds the site and
    /// with an invalid transition when the action is not allowed from the
    /// site's current state.
    pub async fn transition(&self, id: &SiteId, action: SiteAction) -> ControlResult<SiteRecord> {
        let record = self.site(id).await?;
        if let Some(ref job) = record.data.active_job {
            return Err(ControlError::StateConflict {
                kind: EntityKind::Site,
                id: id.to_string(),
                job: job.to_string(),
            });
        }

        let current = record.status;
        let held = AnySite::from_record(record.clone()).begin(action)?.status();

        let server = self.registry.server(&record.data.server).await?;
        let (host, path) = if action.runs_on_proxy() {
            (
                server.proxy_server.to_string(),
                format!("proxy/sites/{id}/{action}"),
            )
        } else {
            (
                server.name.to_string(),
                format!("benches/{}/sites/{id}/{action}", record.data.bench),
            )
        };

        let job = JobRequest::new(action.job_type(), JobTarget::Site(id.clone()), host, path)
            .with_payload(serde_json::json!({
                "name": id,
                "bench": record.data.bench,
            }));

        self.store
            .claim_site_transition(
                id,
                Claim {
                    allowed: &[current],
                    during: (held != current).then_some(held),
                    target: action.target(),
                    job: &job.id,
                },
            )
            .await?;

        info!(site = %id, %action, from = %current, job_id = %job.id, "site transition started");

        self.dispatch(id, job).await?;
        self.site(id).await
    }

    /// Suspend an active site at the proxy.
    pub async fn suspend_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Suspend).await
    }

    /// Lift a suspension.
    pub async fn unsuspend_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Unsuspend).await
    }

    /// Deactivate an active site at the proxy.
    pub async fn deactivate_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Deactivate).await
    }

    /// Reactivate an inactive site.
    pub async fn activate_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Activate).await
    }

    /// Reinstall an active or broken site.
    pub async fn restore_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Restore).await
    }

    /// Remove a site for good.
    pub async fn archive_site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.transition(id, SiteAction::Archive).await
    }

    /// Submit a job for a site that already holds its slot.
    async fn dispatch(&self, id: &SiteId, job: JobRequest) -> ControlResult<()> {
        let job_id = job.id.clone();
        if let Err(e) = self.dispatcher.submit(job).await {
            error!(site = %id, job_id = %job_id, error = %e, "site job submission failed");
            let broken = AnySite::from_record(self.site(id).await?).fail(e.to_string())?;
            self.store
                .finish_site_transition(
                    id,
                    &job_id,
                    broken.status(),
                    broken.data().error.as_deref(),
                )
                .await?;
        }
        Ok(())
    }

    /// Get a site.
    pub async fn site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.store
            .get_site(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))
    }

    /// List sites.
    pub async fn sites(&self, filter: &SiteFilter) -> ControlResult<Vec<SiteRecord>> {
        self.store.list_sites(filter).await
    }

    /// The site after a successful `job_type` job.
    fn succeeded(record: SiteRecord, job_type: JobType) -> ControlResult<AnySite> {
        let site = AnySite::from_record(record);
        if job_type == JobType::NewSite {
            return site.finish_install();
        }
        let action = SiteAction::from_job_type(job_type).ok_or_else(|| {
            ControlError::internal(format!("unexpected job type for site: {job_type}"))
        })?;
        site.complete(action)
    }
}

#[async_trait]
impl JobCompletionHandler for SiteManager {
    async fn job_delivered(&self, job: &AgentJobRecord) -> ControlResult<()> {
        let JobTarget::Site(ref id) = job.target else {
            return Ok(());
        };

        let record = self.site(id).await?;
        if job.job_type != JobType::NewSite
            || record.status != SiteStatus::Pending
            || record.data.active_job.as_ref() != Some(&job.id)
        {
            debug!(site = %id, job_id = %job.id, job_type = %job.job_type, "site job delivered");
            return Ok(());
        }

        let installing = AnySite::from_record(record).start_installing()?;
        if self
            .store
            .progress_site_transition(id, &job.id, SiteStatus::Pending, installing.status())
            .await?
        {
            info!(site = %id, job_id = %job.id, "site installing");
        }
        Ok(())
    }

    async fn job_completed(
        &self,
        job: &AgentJobRecord,
        outcome: &JobOutcome,
    ) -> ControlResult<()> {
        let JobTarget::Site(ref id) = job.target else {
            return Ok(());
        };

        let record = self.site(id).await?;
        if record.data.active_job.as_ref() != Some(&job.id) {
            warn!(
                site = %id,
                job_id = %job.id,
                "ignoring outcome of job that does not own the site"
            );
            return Ok(());
        }

        let next = if outcome.is_success() {
            Self::succeeded(record.clone(), job.job_type)
        } else {
            AnySite::from_record(record.clone()).fail(outcome.error().unwrap_or_default())
        };
        let next = match next {
            Ok(next) => next,
            Err(e) => AnySite::from_record(record).fail(e.to_string())?,
        };
        let to = next.status();

        if self
            .store
            .finish_site_transition(id, &job.id, to, next.data().error.as_deref())
            .await?
        {
            info!(site = %id, status = %to, job_id = %job.id, "site transition finished");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SiteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteManager")
            .field("root_domain", &self.root_domain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_debug_hides_password() {
        let request: SiteRequest = serde_json::from_value(serde_json::json!({
            "subdomain": "acme",
            "server": "f1.harbour.test",
            "bench": "bench-erp-abc123",
            "plan": "basic",
            "apps": ["erp"],
            "admin_password": "hunter2",
        }))
        .unwrap();
        let printed = format!("{request:?}");
        assert!(printed.contains("acme"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn success_follows_lifecycle() {
        let now = Utc::now();
        let record = SiteRecord {
            data: SiteData {
                name: SiteId::new("acme.harbour.test"),
                subdomain: "acme".to_owned(),
                bench: BenchId::new("bench-erp-abc123"),
                server: ServerId::new("f1.harbour.test"),
                plan: PlanId::new("basic"),
                apps: vec![AppId::new("erp")],
                active_job: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
            status: SiteStatus::Installing,
        };

        assert_eq!(
            SiteManager::succeeded(record.clone(), JobType::RestoreSite)
                .unwrap()
                .status(),
            SiteStatus::Active
        );
        assert_eq!(
            SiteManager::succeeded(record.clone(), JobType::NewSite)
                .unwrap()
                .status(),
            SiteStatus::Active
        );
        assert!(SiteManager::succeeded(record.clone(), JobType::SuspendSite).is_err());
        assert!(SiteManager::succeeded(record, JobType::NewBench).is_err());
    }
}
