//! Persistence boundary for control-plane records.
//!
//! Each entity has its own repository trait. [`ControlStore`] is the union
//! the components are handed. Every method is a single transaction; the
//! methods documented as atomic are the places where cross-record
//! invariants (capacity, one in-flight job, one primary domain) are held.
//!
//! Two implementations are provided: [`PostgresStore`] for production and
//! [`MemoryStore`] for tests and as a fallback when no database is
//! reachable.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::{
    AgentJobRecord, AppRecord, BenchRecord, DeployCandidateRecord, PlanRecord,
    ProxyServerRecord, ReleaseGroupRecord, ServerRecord, SiteDomainRecord, SiteRecord,
};
use crate::types::{
    AgentJobId, AppId, BenchId, BenchStatus, CandidateStatus, DeployCandidateId, DomainId,
    HostStatus, JobStatus, JobTarget, PlanId, ProxyServerId, ReleaseGroupId, ServerId, SiteId,
    SiteStatus,
};

/// Request to claim an entity's single lifecycle slot for a job.
#[derive(Debug, Clone, Copy)]
pub struct Claim<'a, S> {
    /// States the transition may start from.
    pub allowed: &'a [S],
    /// State to hold while the job runs, if it differs from the current one.
    pub during: Option<S>,
    /// State the transition aims for, used in error messages.
    pub target: S,
    /// Job that will own the slot.
    pub job: &'a AgentJobId,
}

/// Fails unless `bench` can take a new site: active and with no lifecycle
/// job in flight.
pub(crate) fn ensure_bench_accepts_sites(bench: &BenchRecord) -> ControlResult<()> {
    if bench.status != BenchStatus::Active {
        return Err(ControlError::not_ready(
            EntityKind::Bench,
            &bench.name,
            bench.status,
            BenchStatus::Active.as_str(),
        ));
    }
    if let Some(ref job) = bench.active_job {
        return Err(ControlError::StateConflict {
            kind: EntityKind::Bench,
            id: bench.name.to_string(),
            job: job.to_string(),
        });
    }
    Ok(())
}

/// Error for archiving a bench that still hosts sites.
fn bench_in_use(id: &BenchId, live: u64) -> ControlError {
    ControlError::validation(format!("bench {id} still hosts {live} site(s)"))
}

/// Filter criteria for listing sites.
#[derive(Debug, Clone, Default)]
pub struct SiteFilter {
    /// Filter by bench.
    pub bench: Option<BenchId>,
    /// Filter by status.
    pub status: Option<SiteStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

impl SiteFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bench: None,
            status: None,
            limit: None,
        }
    }

    /// Filter by bench.
    #[must_use]
    pub fn with_bench(mut self, bench: BenchId) -> Self {
        self.bench = Some(bench);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: SiteStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &SiteRecord) -> bool {
        if let Some(ref bench) = self.bench {
            if &record.data.bench != bench {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Filter criteria for listing agent jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by gated entity.
    pub target: Option<JobTarget>,
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

impl JobFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            target: None,
            status: None,
            limit: None,
        }
    }

    /// Filter by gated entity.
    #[must_use]
    pub fn with_target(mut self, target: JobTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &AgentJobRecord) -> bool {
        if let Some(ref target) = self.target {
            if &record.target != target {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Servers and proxy servers.
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Insert a proxy server unless one with the same name exists.
    ///
    /// Returns the stored record, which is the existing one on a duplicate.
    async fn upsert_proxy_server(&self, record: &ProxyServerRecord)
        -> ControlResult<ProxyServerRecord>;

    /// Get a proxy server by name.
    async fn get_proxy_server(&self, id: &ProxyServerId)
        -> ControlResult<Option<ProxyServerRecord>>;

    /// Insert a server unless one with the same name exists.
    async fn upsert_server(&self, record: &ServerRecord) -> ControlResult<ServerRecord>;

    /// Get a server by name.
    async fn get_server(&self, id: &ServerId) -> ControlResult<Option<ServerRecord>>;

    /// List all servers ordered by name.
    async fn list_servers(&self) -> ControlResult<Vec<ServerRecord>>;

    /// Set a server's status. Errors if the server does not exist.
    async fn set_server_status(&self, id: &ServerId, status: HostStatus) -> ControlResult<()>;

    /// Set a proxy server's status. Errors if the proxy does not exist.
    async fn set_proxy_status(&self, id: &ProxyServerId, status: HostStatus)
        -> ControlResult<()>;

    /// Record a health observation for whichever host carries `host`.
    ///
    /// Returns false when no server or proxy server has that name.
    async fn record_reachability(
        &self,
        host: &str,
        reachable: bool,
        at: DateTime<Utc>,
    ) -> ControlResult<bool>;
}

/// Apps, release groups and deploy candidates.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Insert an app unless one with the same name exists.
    async fn upsert_app(&self, record: &AppRecord) -> ControlResult<AppRecord>;

    /// Get an app by name.
    async fn get_app(&self, id: &AppId) -> ControlResult<Option<AppRecord>>;

    /// Insert a release group unless one with the same name exists.
    async fn upsert_release_group(
        &self,
        record: &ReleaseGroupRecord,
    ) -> ControlResult<ReleaseGroupRecord>;

    /// Get a release group by name.
    async fn get_release_group(
        &self,
        id: &ReleaseGroupId,
    ) -> ControlResult<Option<ReleaseGroupRecord>>;

    /// Append an app to a group's app list.
    ///
    /// Fails with an invariant violation once the group is frozen. Adding an
    /// app that is already present is a no-op.
    async fn add_group_app(
        &self,
        group: &ReleaseGroupId,
        app: &AppId,
    ) -> ControlResult<ReleaseGroupRecord>;

    /// Insert a deploy candidate and freeze its group, atomically.
    async fn insert_candidate(&self, record: &DeployCandidateRecord) -> ControlResult<()>;

    /// Get a deploy candidate by ID.
    async fn get_candidate(
        &self,
        id: &DeployCandidateId,
    ) -> ControlResult<Option<DeployCandidateRecord>>;

    /// List a group's candidates, newest first.
    async fn list_candidates(
        &self,
        group: &ReleaseGroupId,
    ) -> ControlResult<Vec<DeployCandidateRecord>>;

    /// Move a candidate from `from` to `to`.
    ///
    /// `job` replaces the recorded build job when given. Returns false when
    /// the candidate was not in `from`.
    async fn transition_candidate(
        &self,
        id: &DeployCandidateId,
        from: CandidateStatus,
        to: CandidateStatus,
        job: Option<&AgentJobId>,
        error: Option<&str>,
    ) -> ControlResult<bool>;
}

/// Benches.
#[async_trait]
pub trait BenchStore: Send + Sync {
    /// Insert a bench if its server has room, atomically.
    ///
    /// Benches that occupy capacity on the same server are counted in the
    /// same transaction as the insert; `limit = None` means unlimited.
    async fn insert_bench_within_capacity(
        &self,
        record: &BenchRecord,
        limit: Option<u32>,
    ) -> ControlResult<()>;

    /// Get a bench by name.
    async fn get_bench(&self, id: &BenchId) -> ControlResult<Option<BenchRecord>>;

    /// List benches, optionally restricted to one server.
    async fn list_benches(&self, server: Option<&ServerId>) -> ControlResult<Vec<BenchRecord>>;

    /// Claim the bench's lifecycle slot for `claim.job`.
    ///
    /// A claim targeting `Archived` also fails while any site on the bench
    /// is not archived. The check and the claim are one transaction, and
    /// [`SiteStore::insert_site`] checks the slot under the same lock.
    async fn claim_bench_transition(
        &self,
        id: &BenchId,
        claim: Claim<'_, BenchStatus>,
    ) -> ControlResult<BenchRecord>;

    /// Finish the transition owned by `job`, releasing the slot.
    ///
    /// Returns false when `job` does not own the slot.
    async fn finish_bench_transition(
        &self,
        id: &BenchId,
        job: &AgentJobId,
        to: BenchStatus,
        error: Option<&str>,
    ) -> ControlResult<bool>;
}

/// Plans.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Insert a plan unless one with the same name exists.
    async fn upsert_plan(&self, record: &PlanRecord) -> ControlResult<PlanRecord>;

    /// Get a plan by name.
    async fn get_plan(&self, id: &PlanId) -> ControlResult<Option<PlanRecord>>;
}

/// Sites.
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Insert a new site. Fails if the name is taken.
    ///
    /// The site's bench is checked in the same transaction: it must exist,
    /// be active and have no lifecycle job in flight.
    async fn insert_site(&self, record: &SiteRecord) -> ControlResult<()>;

    /// Get a site by name.
    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<SiteRecord>>;

    /// List sites matching the filter, ordered by name.
    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<SiteRecord>>;

    /// Claim the site's lifecycle slot for `claim.job`.
    ///
    /// Fails with a state conflict while another job owns the slot and with
    /// an invalid transition when the site is not in an allowed state.
    async fn claim_site_transition(
        &self,
        id: &SiteId,
        claim: Claim<'_, SiteStatus>,
    ) -> ControlResult<SiteRecord>;

    /// Move the site from `from` to `to` while `job` keeps the slot.
    ///
    /// Returns false when `job` does not own the slot or the site is not in
    /// `from`.
    async fn progress_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        from: SiteStatus,
        to: SiteStatus,
    ) -> ControlResult<bool>;

    /// Finish the transition owned by `job`, releasing the slot.
    async fn finish_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        to: SiteStatus,
        error: Option<&str>,
    ) -> ControlResult<bool>;
}

/// Site domains.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Insert a domain. Fails if the hostname is bound already.
    ///
    /// When the record is primary, every other domain of the same site is
    /// demoted in the same transaction.
    async fn insert_domain(&self, record: &SiteDomainRecord) -> ControlResult<()>;

    /// Get a domain by hostname.
    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<SiteDomainRecord>>;

    /// List a site's domains, oldest first.
    async fn list_domains(&self, site: &SiteId) -> ControlResult<Vec<SiteDomainRecord>>;

    /// Set a domain's primary flag.
    ///
    /// Setting it demotes every other domain of the same site in the same
    /// transaction.
    async fn set_domain_primary(
        &self,
        id: &DomainId,
        primary: bool,
    ) -> ControlResult<SiteDomainRecord>;

    /// Delete a domain.
    async fn delete_domain(&self, id: &DomainId) -> ControlResult<()>;
}

/// Agent jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record.
    async fn insert_job(&self, record: &AgentJobRecord) -> ControlResult<()>;

    /// Get a job by ID.
    async fn get_job(&self, id: &AgentJobId) -> ControlResult<Option<AgentJobRecord>>;

    /// List jobs matching the filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> ControlResult<Vec<AgentJobRecord>>;

    /// List jobs without a final outcome, oldest first.
    async fn list_open_jobs(&self) -> ControlResult<Vec<AgentJobRecord>>;

    /// Record a successful delivery attempt.
    ///
    /// Only applies to undelivered jobs; returns false otherwise.
    async fn mark_job_delivered(&self, id: &AgentJobId, remote_id: &str) -> ControlResult<bool>;

    /// Record a failed delivery attempt, leaving the job undelivered.
    async fn record_job_attempt(&self, id: &AgentJobId, error: &str) -> ControlResult<()>;

    /// Record the job's final outcome.
    ///
    /// Only applies to jobs without an outcome; returns false otherwise.
    async fn finish_job(
        &self,
        id: &AgentJobId,
        status: JobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> ControlResult<bool>;
}

/// Every repository the control plane needs.
pub trait ControlStore:
    ServerStore + ReleaseStore + BenchStore + PlanStore + SiteStore + DomainStore + JobStore
{
}

impl<T> ControlStore for T where
    T: ServerStore + ReleaseStore + BenchStore + PlanStore + SiteStore + DomainStore + JobStore
{
}
