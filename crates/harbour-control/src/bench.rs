//! Bench manager.
//!
//! A bench is a deployed runtime environment on one server, built from a
//! deploy candidate. Creation is gated on the candidate being built, the
//! server being active and the server having room under the capacity
//! policy; the actual setup runs as an agent job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::agent::{JobCompletionHandler, JobDispatcher, JobOutcome, JobRequest};
use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::{AgentJobRecord, BenchRecord};
use crate::registry::CapacityRegistry;
use crate::store::{Claim, ControlStore};
use crate::types::{
    BenchId, BenchStatus, CandidateStatus, DeployCandidateId, JobTarget, JobType,
    ReleaseGroupId, ServerId,
};

/// Agent path for bench creation.
const BENCH_PATH: &str = "benches";

/// Length of the random suffix in generated bench names.
const SUFFIX_LENGTH: usize = 6;

const fn default_workers() -> u32 {
    1
}

/// Request to create a bench.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchRequest {
    /// Built candidate to deploy.
    pub candidate: DeployCandidateId,
    /// Server to place the bench on.
    pub server: ServerId,
    /// Background worker count.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Web worker count.
    #[serde(default = "default_workers")]
    pub gunicorn_workers: u32,
}

/// Generate a bench name for a release group.
fn bench_name(group: &ReleaseGroupId) -> BenchId {
    let ulid = ulid::Ulid::new().to_string().to_lowercase();
    let suffix = &ulid[ulid.len() - SUFFIX_LENGTH..];
    BenchId::new(format!("bench-{group}-{suffix}"))
}

/// Creates and archives benches.
pub struct BenchManager {
    store: Arc<dyn ControlStore>,
    registry: Arc<CapacityRegistry>,
    dispatcher: Arc<JobDispatcher>,
}

impl BenchManager {
    /// Create a new bench manager.
    pub fn new(
        store: Arc<dyn ControlStore>,
        registry: Arc<CapacityRegistry>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
        }
    }

    /// Create a bench and start setting it up on its server.
    ///
    /// All preconditions are checked before anything is written. The bench
    /// is returned pending; it becomes active once the setup job succeeds.
    pub async fn create_bench(&self, request: BenchRequest) -> ControlResult<BenchRecord> {
        if request.workers == 0 || request.gunicorn_workers == 0 {
            return Err(ControlError::validation(
                "a bench needs at least one worker of each kind",
            ));
        }

        let candidate = self
            .store
            .get_candidate(&request.candidate)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(EntityKind::DeployCandidate, &request.candidate)
            })?;
        if candidate.status != CandidateStatus::Built {
            return Err(ControlError::not_ready(
                EntityKind::DeployCandidate,
                &candidate.id,
                candidate.status,
                CandidateStatus::Built.as_str(),
            ));
        }

        let server = self.registry.require_active_server(&request.server).await?;
        let limit = self.registry.bench_limit(&server);

        let group = self
            .store
            .get_release_group(&candidate.group)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, &candidate.group))?;

        let name = bench_name(&candidate.group);
        let job = JobRequest::new(
            JobType::NewBench,
            JobTarget::Bench(name.clone()),
            server.name.as_str(),
            BENCH_PATH,
        )
        .with_payload(serde_json::json!({
            "name": name,
            "group": candidate.group,
            "candidate": candidate.id,
            "apps": candidate.apps,
            "workers": request.workers,
            "gunicorn_workers": request.gunicorn_workers,
            "config": group.config,
        }));

        let now = Utc::now();
        let record = BenchRecord {
            name: name.clone(),
            group: candidate.group.clone(),
            candidate: candidate.id.clone(),
            server: server.name.clone(),
            workers: request.workers,
            gunicorn_workers: request.gunicorn_workers,
            status: BenchStatus::Pending,
            active_job: Some(job.id.clone()),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_bench_within_capacity(&record, limit).await?;

        info!(
            bench = %name,
            server = %server.name,
            candidate = %candidate.id,
            job_id = %job.id,
            "bench creation started"
        );

        self.dispatch(&name, job).await?;
        self.bench(&name).await
    }

    /// Archive a bench that no longer hosts live sites.
    ///
    /// The live-site check is part of the store's claim, and the claim keeps
    /// new sites off the bench until the archive job finishes.
    pub async fn archive_bench(&self, id: &BenchId) -> ControlResult<BenchRecord> {
        let bench = self.bench(id).await?;

        let job = JobRequest::new(
            JobType::ArchiveBench,
            JobTarget::Bench(id.clone()),
            bench.server.as_str(),
            format!("{BENCH_PATH}/{id}/archive"),
        );

        self.store
            .claim_bench_transition(
                id,
                Claim {
                    allowed: &[BenchStatus::Active, BenchStatus::Broken],
                    during: None,
                    target: BenchStatus::Archived,
                    job: &job.id,
                },
            )
            .await?;

        info!(bench = %id, job_id = %job.id, "bench archive started");

        self.dispatch(id, job).await?;
        self.bench(id).await
    }

    /// Submit a job for a bench that already holds its slot.
    async fn dispatch(&self, id: &BenchId, job: JobRequest) -> ControlResult<()> {
        let job_id = job.id.clone();
        if let Err(e) = self.dispatcher.submit(job).await {
            error!(bench = %id, job_id = %job_id, error = %e, "bench job submission failed");
            self.store
                .finish_bench_transition(id, &job_id, BenchStatus::Broken, Some(&e.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Get a bench.
    pub async fn bench(&self, id: &BenchId) -> ControlResult<BenchRecord> {
        self.store
            .get_bench(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, id))
    }

    /// List benches, optionally on one server.
    pub async fn benches(&self, server: Option<&ServerId>) -> ControlResult<Vec<BenchRecord>> {
        self.store.list_benches(server).await
    }
}

#[async_trait]
impl JobCompletionHandler for BenchManager {
    async fn job_delivered(&self, job: &AgentJobRecord) -> ControlResult<()> {
        debug!(job_id = %job.id, target = %job.target, "bench job accepted by agent");
        Ok(())
    }

    async fn job_completed(
        &self,
        job: &AgentJobRecord,
        outcome: &JobOutcome,
    ) -> ControlResult<()> {
        let JobTarget::Bench(ref id) = job.target else {
            return Ok(());
        };

        let to = match (job.job_type, outcome.is_success()) {
            (JobType::NewBench, true) => BenchStatus::Active,
            (JobType::ArchiveBench, true) => BenchStatus::Archived,
            (_, false) => BenchStatus::Broken,
            (other, true) => {
                return Err(ControlError::internal(format!(
                    "unexpected job type for bench: {other}"
                )))
            }
        };

        let error = outcome.error();
        if self
            .store
            .finish_bench_transition(id, &job.id, to, error.as_deref())
            .await?
        {
            info!(bench = %id, status = %to, job_id = %job.id, "bench transition finished");
        } else {
            warn!(
                bench = %id,
                job_id = %job.id,
                "ignoring outcome of job that does not own the bench"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for BenchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenchManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bench_names_carry_group() {
        let name = bench_name(&ReleaseGroupId::new("erp"));
        assert!(name.as_str().starts_with("bench-erp-"));
        assert_eq!(name.as_str().len(), "bench-erp-".len() + SUFFIX_LENGTH);
        assert_ne!(name, bench_name(&ReleaseGroupId::new("erp")));
    }

    #[test]
    fn request_defaults_to_one_worker() {
        let request: BenchRequest = serde_json::from_str(
            r#"{"candidate": "01j0", "server": "f1.harbour.test"}"#,
        )
        .unwrap();
        assert_eq!(request.workers, 1);
        assert_eq!(request.gunicorn_workers, 1);
    }
}
