//! Release pipeline: apps, release groups and deploy candidates.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::agent::{JobCompletionHandler, JobDispatcher, JobOutcome, JobRequest};
use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::{
    AgentJobRecord, AppRecord, AppSnapshot, DeployCandidateRecord, ReleaseGroupRecord,
};
use crate::registry::CapacityRegistry;
use crate::store::ControlStore;
use crate::types::{
    AppId, CandidateStatus, DeployCandidateId, JobTarget, JobType, ReleaseGroupId, ServerId,
};

/// Agent path for candidate builds.
const BUILD_PATH: &str = "builds";

const fn default_enabled() -> bool {
    true
}

fn default_group_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Definition of an app pinned at a commit.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSpec {
    /// App name.
    pub name: AppId,
    /// Source repository URL.
    pub repository: String,
    /// Branch.
    pub branch: String,
    /// Commit hash.
    pub hash: String,
}

/// Definition of a release group.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseGroupSpec {
    /// Group name.
    pub name: ReleaseGroupId,
    /// Apps in install order.
    pub apps: Vec<AppId>,
    /// Whether candidates may be taken from the group.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Deploy configuration.
    #[serde(default = "default_group_config")]
    pub config: serde_json::Value,
}

/// Owns apps, release groups and deploy candidates.
pub struct ReleasePipeline {
    store: Arc<dyn ControlStore>,
    registry: Arc<CapacityRegistry>,
    dispatcher: Arc<JobDispatcher>,
    builder_server: Option<ServerId>,
}

impl ReleasePipeline {
    /// Create a new release pipeline.
    ///
    /// Builds run on `builder_server`; without one, no candidate can be
    /// created.
    pub fn new(
        store: Arc<dyn ControlStore>,
        registry: Arc<CapacityRegistry>,
        dispatcher: Arc<JobDispatcher>,
        builder_server: Option<ServerId>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            builder_server,
        }
    }

    /// Store an app, returning the existing record on a repeat.
    pub async fn upsert_app(&self, spec: AppSpec) -> ControlResult<AppRecord> {
        if spec.name.as_str().is_empty() {
            return Err(ControlError::validation("app name cannot be empty"));
        }
        if spec.repository.is_empty() || spec.branch.is_empty() || spec.hash.is_empty() {
            return Err(ControlError::validation(format!(
                "app {} needs a repository, branch and hash",
                spec.name
            )));
        }

        let record = AppRecord {
            name: spec.name,
            repository: spec.repository,
            branch: spec.branch,
            hash: spec.hash,
            created_at: Utc::now(),
        };
        let stored = self.store.upsert_app(&record).await?;
        debug!(app = %stored.name, hash = %stored.hash, "app stored");
        Ok(stored)
    }

    /// Store a release group, returning the existing record on a repeat.
    pub async fn upsert_release_group(
        &self,
        spec: ReleaseGroupSpec,
    ) -> ControlResult<ReleaseGroupRecord> {
        if spec.apps.is_empty() {
            return Err(ControlError::validation(format!(
                "release group {} needs at least one app",
                spec.name
            )));
        }

        let mut seen = HashSet::new();
        for app in &spec.apps {
            if !seen.insert(app) {
                return Err(ControlError::validation(format!(
                    "app {app} listed twice in release group {}",
                    spec.name
                )));
            }
            self.require_app(app).await?;
        }

        let now = Utc::now();
        let record = ReleaseGroupRecord {
            name: spec.name,
            apps: spec.apps,
            enabled: spec.enabled,
            frozen: false,
            config: spec.config,
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.upsert_release_group(&record).await?;
        info!(group = %stored.name, apps = stored.apps.len(), "release group stored");
        Ok(stored)
    }

    /// Add an app to a group that has no candidates yet.
    pub async fn add_app(
        &self,
        group: &ReleaseGroupId,
        app: &AppId,
    ) -> ControlResult<ReleaseGroupRecord> {
        self.require_app(app).await?;
        let record = self.store.add_group_app(group, app).await?;
        info!(group = %group, app = %app, "app added to release group");
        Ok(record)
    }

    async fn require_app(&self, app: &AppId) -> ControlResult<AppRecord> {
        self.store
            .get_app(app)
            .await?
            .ok_or_else(|| ControlError::validation(format!("unknown app: {app}")))
    }

    /// Get a release group.
    pub async fn release_group(&self, id: &ReleaseGroupId) -> ControlResult<ReleaseGroupRecord> {
        self.store
            .get_release_group(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, id))
    }

    /// Snapshot a group's apps and start building them.
    ///
    /// Returns the candidate in the building state; the build outcome
    /// arrives later through the job dispatcher.
    pub async fn create_deploy_candidate(
        &self,
        group: &ReleaseGroupId,
    ) -> ControlResult<DeployCandidateRecord> {
        let group = self
            .store
            .get_release_group(group)
            .await?
            .ok_or_else(|| ControlError::validation(format!("unknown release group: {group}")))?;

        if !group.enabled {
            return Err(ControlError::validation(format!(
                "release group {} is disabled",
                group.name
            )));
        }

        let builder = self
            .builder_server
            .as_ref()
            .ok_or_else(|| ControlError::Config("no builder server configured".to_owned()))?;
        let builder = self.registry.require_active_server(builder).await?;

        let mut apps = Vec::with_capacity(group.apps.len());
        for app in &group.apps {
            let record = self.store.get_app(app).await?.ok_or_else(|| {
                ControlError::invariant(format!("group {} lists unknown app {app}", group.name))
            })?;
            apps.push(AppSnapshot::from(&record));
        }

        let now = Utc::now();
        let candidate = DeployCandidateRecord {
            id: DeployCandidateId::generate(),
            group: group.name.clone(),
            apps,
            build_server: builder.name.clone(),
            status: CandidateStatus::Pending,
            job: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_candidate(&candidate).await?;

        let request = JobRequest::new(
            JobType::BuildCandidate,
            JobTarget::DeployCandidate(candidate.id.clone()),
            builder.name.as_str(),
            BUILD_PATH,
        )
        .with_payload(serde_json::json!({
            "candidate": candidate.id,
            "group": group.name,
            "apps": candidate.apps,
            "config": group.config,
        }));

        self.store
            .transition_candidate(
                &candidate.id,
                CandidateStatus::Pending,
                CandidateStatus::Building,
                Some(&request.id),
                None,
            )
            .await?;

        info!(
            candidate = %candidate.id,
            group = %group.name,
            builder = %builder.name,
            job_id = %request.id,
            "deploy candidate build started"
        );

        let job_id = request.id.clone();
        if let Err(e) = self.dispatcher.submit(request).await {
            error!(candidate = %candidate.id, error = %e, "build submission failed");
            self.store
                .transition_candidate(
                    &candidate.id,
                    CandidateStatus::Building,
                    CandidateStatus::Failed,
                    Some(&job_id),
                    Some(&e.to_string()),
                )
                .await?;
        }

        self.deploy_candidate(&candidate.id).await
    }

    /// Get a deploy candidate.
    pub async fn deploy_candidate(
        &self,
        id: &DeployCandidateId,
    ) -> ControlResult<DeployCandidateRecord> {
        self.store
            .get_candidate(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::DeployCandidate, id))
    }

    /// List a group's candidates, newest first.
    pub async fn candidates_for_group(
        &self,
        group: &ReleaseGroupId,
    ) -> ControlResult<Vec<DeployCandidateRecord>> {
        self.store.list_candidates(group).await
    }
}

#[async_trait]
impl JobCompletionHandler for ReleasePipeline {
    async fn job_delivered(&self, job: &AgentJobRecord) -> ControlResult<()> {
        debug!(job_id = %job.id, target = %job.target, "build accepted by agent");
        Ok(())
    }

    async fn job_completed(
        &self,
        job: &AgentJobRecord,
        outcome: &JobOutcome,
    ) -> ControlResult<()> {
        let JobTarget::DeployCandidate(ref id) = job.target else {
            return Ok(());
        };

        let candidate = self.deploy_candidate(id).await?;
        if candidate.job.as_ref() != Some(&job.id) {
            warn!(candidate = %id, job_id = %job.id, "ignoring outcome of superseded build");
            return Ok(());
        }

        let (to, error) = if outcome.is_success() {
            (CandidateStatus::Built, None)
        } else {
            (CandidateStatus::Failed, outcome.error())
        };

        let moved = self
            .store
            .transition_candidate(id, CandidateStatus::Building, to, None, error.as_deref())
            .await?;
        if moved {
            info!(candidate = %id, status = %to, "deploy candidate build finished");
        } else {
            warn!(
                candidate = %id,
                status = %candidate.status,
                "build outcome for candidate not building"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReleasePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasePipeline")
            .field("builder_server", &self.builder_server)
            .finish_non_exhaustive()
    }
}
