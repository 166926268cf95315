//! In-memory control store for testing.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::{
    AgentJobRecord, AppRecord, BenchRecord, DeployCandidateRecord, PlanRecord,
    ProxyServerRecord, ReleaseGroupRecord, ServerRecord, SiteDomainRecord, SiteRecord,
};
use crate::types::{
    AgentJobId, AppId, BenchId, BenchStatus, CandidateStatus, DeployCandidateId, DomainId,
    HostStatus, JobStatus, PlanId, ProxyServerId, ReleaseGroupId, ServerId, SiteId, SiteStatus,
};

use super::{
    bench_in_use, ensure_bench_accepts_sites, BenchStore, Claim, DomainStore, JobFilter, JobStore, PlanStore, ReleaseStore, ServerStore,
    SiteFilter, SiteStore,
};

#[derive(Debug, Default)]
struct Tables {
    proxies: HashMap<ProxyServerId, ProxyServerRecord>,
    servers: HashMap<ServerId, ServerRecord>,
    apps: HashMap<AppId, AppRecord>,
    groups: HashMap<ReleaseGroupId, ReleaseGroupRecord>,
    candidates: HashMap<DeployCandidateId, DeployCandidateRecord>,
    benches: HashMap<BenchId, BenchRecord>,
    plans: HashMap<PlanId, PlanRecord>,
    sites: HashMap<SiteId, SiteRecord>,
    domains: HashMap<DomainId, SiteDomainRecord>,
    jobs: HashMap<AgentJobId, AgentJobRecord>,
}

/// In-memory control store for testing.
///
/// All tables sit behind one lock, so every method observes and mutates a
/// consistent snapshot. Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Poison the table lock so every later call fails.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.tables.write();
            panic!("poisoning memory store");
        }));
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

fn take<T>(items: Vec<T>, limit: Option<u32>) -> Vec<T> {
    match limit.and_then(|l| usize::try_from(l).ok()) {
        Some(limit) => items.into_iter().take(limit).collect(),
        None => items,
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn upsert_proxy_server(
        &self,
        record: &ProxyServerRecord,
    ) -> ControlResult<ProxyServerRecord> {
        let mut tables = self.write()?;
        Ok(tables
            .proxies
            .entry(record.name.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn get_proxy_server(
        &self,
        id: &ProxyServerId,
    ) -> ControlResult<Option<ProxyServerRecord>> {
        Ok(self.read()?.proxies.get(id).cloned())
    }

    async fn upsert_server(&self, record: &ServerRecord) -> ControlResult<ServerRecord> {
        let mut tables = self.write()?;
        Ok(tables
            .servers
            .entry(record.name.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn get_server(&self, id: &ServerId) -> ControlResult<Option<ServerRecord>> {
        Ok(self.read()?.servers.get(id).cloned())
    }

    async fn list_servers(&self) -> ControlResult<Vec<ServerRecord>> {
        let mut servers: Vec<_> = self.read()?.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn set_server_status(&self, id: &ServerId, status: HostStatus) -> ControlResult<()> {
        let mut tables = self.write()?;
        let server = tables
            .servers
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Server, id))?;
        server.status = status;
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn set_proxy_status(
        &self,
        id: &ProxyServerId,
        status: HostStatus,
    ) -> ControlResult<()> {
        let mut tables = self.write()?;
        let proxy = tables
            .proxies
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::ProxyServer, id))?;
        proxy.status = status;
        proxy.updated_at = Utc::now();
        Ok(())
    }

    async fn record_reachability(
        &self,
        host: &str,
        reachable: bool,
        at: DateTime<Utc>,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let last_seen = reachable.then_some(at);

        if let Some(server) = tables.servers.get_mut(&ServerId::new(host)) {
            server.reachable = reachable;
            server.last_seen_at = last_seen.or(server.last_seen_at);
            return Ok(true);
        }
        if let Some(proxy) = tables.proxies.get_mut(&ProxyServerId::new(host)) {
            proxy.reachable = reachable;
            proxy.last_seen_at = last_seen.or(proxy.last_seen_at);
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn upsert_app(&self, record: &AppRecord) -> ControlResult<AppRecord> {
        let mut tables = self.write()?;
        Ok(tables
            .apps
            .entry(record.name.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn get_app(&self, id: &AppId) -> ControlResult<Option<AppRecord>> {
        Ok(self.read()?.apps.get(id).cloned())
    }

    async fn upsert_release_group(
        &self,
        record: &ReleaseGroupRecord,
    ) -> ControlResult<ReleaseGroupRecord> {
        let mut tables = self.write()?;
        Ok(tables
            .groups
            .entry(record.name.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn get_release_group(
        &self,
        id: &ReleaseGroupId,
    ) -> ControlResult<Option<ReleaseGroupRecord>> {
        Ok(self.read()?.groups.get(id).cloned())
    }

    async fn add_group_app(
        &self,
        group: &ReleaseGroupId,
        app: &AppId,
    ) -> ControlResult<ReleaseGroupRecord> {
        let mut tables = self.write()?;
        let record = tables
            .groups
            .get_mut(group)
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, group))?;

        if record.apps.contains(app) {
            return Ok(record.clone());
        }
        if record.frozen {
            return Err(ControlError::invariant(format!(
                "release group {group} has deploy candidates; its apps are fixed"
            )));
        }

        record.apps.push(app.clone());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn insert_candidate(&self, record: &DeployCandidateRecord) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.candidates.contains_key(&record.id) {
            return Err(ControlError::internal(format!(
                "deploy candidate {} already exists",
                record.id
            )));
        }

        let group = tables
            .groups
            .get_mut(&record.group)
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, &record.group))?;
        group.frozen = true;
        group.updated_at = Utc::now();

        tables.candidates.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_candidate(
        &self,
        id: &DeployCandidateId,
    ) -> ControlResult<Option<DeployCandidateRecord>> {
        Ok(self.read()?.candidates.get(id).cloned())
    }

    async fn list_candidates(
        &self,
        group: &ReleaseGroupId,
    ) -> ControlResult<Vec<DeployCandidateRecord>> {
        let mut candidates: Vec<_> = self
            .read()?
            .candidates
            .values()
            .filter(|c| &c.group == group)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(candidates)
    }

    async fn transition_candidate(
        &self,
        id: &DeployCandidateId,
        from: CandidateStatus,
        to: CandidateStatus,
        job: Option<&AgentJobId>,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let candidate = tables
            .candidates
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::DeployCandidate, id))?;

        if candidate.status != from {
            return Ok(false);
        }

        candidate.status = to;
        if let Some(job) = job {
            candidate.job = Some(job.clone());
        }
        candidate.error = error.map(ToOwned::to_owned);
        candidate.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl BenchStore for MemoryStore {
    async fn insert_bench_within_capacity(
        &self,
        record: &BenchRecord,
        limit: Option<u32>,
    ) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.benches.contains_key(&record.name) {
            return Err(ControlError::validation(format!(
                "bench {} already exists",
                record.name
            )));
        }

        if let Some(limit) = limit {
            let in_use = tables
                .benches
                .values()
                .filter(|b| b.server == record.server && b.status.occupies_capacity())
                .count();
            let in_use = u32::try_from(in_use).unwrap_or(u32::MAX);
            if in_use >= limit {
                return Err(ControlError::Capacity {
                    server: record.server.to_string(),
                    benches: in_use,
                    limit,
                });
            }
        }

        tables.benches.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn get_bench(&self, id: &BenchId) -> ControlResult<Option<BenchRecord>> {
        Ok(self.read()?.benches.get(id).cloned())
    }

    async fn list_benches(&self, server: Option<&ServerId>) -> ControlResult<Vec<BenchRecord>> {
        let mut benches: Vec<_> = self
            .read()?
            .benches
            .values()
            .filter(|b| server.map_or(true, |s| &b.server == s))
            .cloned()
            .collect();
        benches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(benches)
    }

    async fn claim_bench_transition(
        &self,
        id: &BenchId,
        claim: Claim<'_, BenchStatus>,
    ) -> ControlResult<BenchRecord> {
        let mut tables = self.write()?;
        let bench = tables
            .benches
            .get(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, id))?;

        if let Some(ref job) = bench.active_job {
            return Err(ControlError::StateConflict {
                kind: EntityKind::Bench,
                id: id.to_string(),
                job: job.to_string(),
            });
        }
        if !claim.allowed.contains(&bench.status) {
            return Err(ControlError::InvalidStateTransition {
                from: bench.status.as_str(),
                to: claim.target.as_str(),
            });
        }

        if claim.target == BenchStatus::Archived {
            let live = tables
                .sites
                .values()
                .filter(|s| &s.data.bench == id && s.status != SiteStatus::Archived)
                .count();
            if live > 0 {
                return Err(bench_in_use(id, u64::try_from(live).unwrap_or(u64::MAX)));
            }
        }

        let bench = tables
            .benches
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, id))?;
        bench.active_job = Some(claim.job.clone());
        if let Some(during) = claim.during {
            bench.status = during;
        }
        bench.updated_at = Utc::now();
        Ok(bench.clone())
    }

    async fn finish_bench_transition(
        &self,
        id: &BenchId,
        job: &AgentJobId,
        to: BenchStatus,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let bench = tables
            .benches
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, id))?;

        if bench.active_job.as_ref() != Some(job) {
            return Ok(false);
        }

        bench.status = to;
        bench.active_job = None;
        bench.error = error.map(ToOwned::to_owned);
        bench.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn upsert_plan(&self, record: &PlanRecord) -> ControlResult<PlanRecord> {
        let mut tables = self.write()?;
        Ok(tables
            .plans
            .entry(record.name.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn get_plan(&self, id: &PlanId) -> ControlResult<Option<PlanRecord>> {
        Ok(self.read()?.plans.get(id).cloned())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn insert_site(&self, record: &SiteRecord) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.sites.contains_key(record.name()) {
            return Err(ControlError::validation(format!(
                "site {} already exists",
                record.name()
            )));
        }
        let bench = tables
            .benches
            .get(&record.data.bench)
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, &record.data.bench))?;
        ensure_bench_accepts_sites(bench)?;
        tables.sites.insert(record.name().clone(), record.clone());
        Ok(())
    }

    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<SiteRecord>> {
        Ok(self.read()?.sites.get(id).cloned())
    }

    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<SiteRecord>> {
        let mut sites: Vec<_> = self
            .read()?
            .sites
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sites.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(take(sites, filter.limit))
    }

    async fn claim_site_transition(
        &self,
        id: &SiteId,
        claim: Claim<'_, SiteStatus>,
    ) -> ControlResult<SiteRecord> {
        let mut tables = self.write()?;
        let site = tables
            .sites
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))?;

        if let Some(ref job) = site.data.active_job {
            return Err(ControlError::StateConflict {
                kind: EntityKind::Site,
                id: id.to_string(),
                job: job.to_string(),
            });
        }
        if !claim.allowed.contains(&site.status) {
            return Err(ControlError::InvalidStateTransition {
                from: site.status.as_str(),
                to: claim.target.as_str(),
            });
        }

        site.data.active_job = Some(claim.job.clone());
        if let Some(during) = claim.during {
            site.status = during;
        }
        site.data.updated_at = Utc::now();
        Ok(site.clone())
    }

    async fn progress_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        from: SiteStatus,
        to: SiteStatus,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let site = tables
            .sites
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))?;

        if site.data.active_job.as_ref() != Some(job) || site.status != from {
            return Ok(false);
        }

        site.status = to;
        site.data.updated_at = Utc::now();
        Ok(true)
    }

    async fn finish_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        to: SiteStatus,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let site = tables
            .sites
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))?;

        if site.data.active_job.as_ref() != Some(job) {
            return Ok(false);
        }

        site.status = to;
        site.data.active_job = None;
        site.data.error = error.map(ToOwned::to_owned);
        site.data.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn insert_domain(&self, record: &SiteDomainRecord) -> ControlResult<()> {
        let mut tables = self.write()?;
        if let Some(existing) = tables.domains.get(&record.name) {
            return Err(ControlError::validation(format!(
                "domain {} is already bound to {}",
                record.name, existing.site
            )));
        }

        if record.primary {
            let now = Utc::now();
            for domain in tables.domains.values_mut() {
                if domain.site == record.site && domain.primary {
                    domain.primary = false;
                    domain.updated_at = now;
                }
            }
        }

        tables.domains.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<SiteDomainRecord>> {
        Ok(self.read()?.domains.get(id).cloned())
    }

    async fn list_domains(&self, site: &SiteId) -> ControlResult<Vec<SiteDomainRecord>> {
        let mut domains: Vec<_> = self
            .read()?
            .domains
            .values()
            .filter(|d| &d.site == site)
            .cloned()
            .collect();
        domains.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(domains)
    }

    async fn set_domain_primary(
        &self,
        id: &DomainId,
        primary: bool,
    ) -> ControlResult<SiteDomainRecord> {
        let mut tables = self.write()?;
        let site = tables
            .domains
            .get(id)
            .map(|d| d.site.clone())
            .ok_or_else(|| ControlError::not_found(EntityKind::SiteDomain, id))?;

        let now = Utc::now();
        if primary {
            for domain in tables.domains.values_mut() {
                if domain.site == site && domain.primary && &domain.name != id {
                    domain.primary = false;
                    domain.updated_at = now;
                }
            }
        }

        let domain = tables
            .domains
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::SiteDomain, id))?;
        domain.primary = primary;
        domain.updated_at = now;
        Ok(domain.clone())
    }

    async fn delete_domain(&self, id: &DomainId) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.domains.remove(id).is_none() {
            return Err(ControlError::not_found(EntityKind::SiteDomain, id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, record: &AgentJobRecord) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&record.id) {
            return Err(ControlError::internal(format!(
                "agent job {} already exists",
                record.id
            )));
        }
        tables.jobs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_job(&self, id: &AgentJobId) -> ControlResult<Option<AgentJobRecord>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> ControlResult<Vec<AgentJobRecord>> {
        let mut jobs: Vec<_> = self
            .read()?
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(take(jobs, filter.limit))
    }

    async fn list_open_jobs(&self) -> ControlResult<Vec<AgentJobRecord>> {
        let mut jobs: Vec<_> = self
            .read()?
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn mark_job_delivered(&self, id: &AgentJobId, remote_id: &str) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::AgentJob, id))?;

        if job.status != JobStatus::Undelivered {
            return Ok(false);
        }

        job.status = JobStatus::Delivered;
        job.remote_id = Some(remote_id.to_owned());
        job.attempts += 1;
        job.error = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_job_attempt(&self, id: &AgentJobId, error: &str) -> ControlResult<()> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::AgentJob, id))?;

        job.attempts += 1;
        job.error = Some(error.to_owned());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_job(
        &self,
        id: &AgentJobId,
        status: JobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(EntityKind::AgentJob, id))?;

        if job.status.is_terminal() {
            return Ok(false);
        }

        job.status = status;
        job.output = output.cloned();
        job.error = error.map(ToOwned::to_owned);
        job.updated_at = Utc::now();
        Ok(true)
    }
}
