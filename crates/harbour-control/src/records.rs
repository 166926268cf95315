//! Persisted entity records.
//!
//! Records reference each other by identifier only. Resolving an identifier
//! always goes back through the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AgentJobId, AppId, BenchId, BenchStatus, CandidateStatus, DeployCandidateId, DomainId,
    HostStatus, JobStatus, JobTarget, JobType, PlanId, ProxyServerId, ReleaseGroupId, ServerId,
    SiteId, SiteStatus,
};

/// A front-facing router host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyServerRecord {
    /// Hostname.
    pub name: ProxyServerId,
    /// Operational status.
    pub status: HostStatus,
    /// Public address.
    pub ip: Option<String>,
    /// Private network address.
    pub private_ip: Option<String>,
    /// Result of the last health observation.
    pub reachable: bool,
    /// When the host last answered a health check.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// When the host was registered.
    pub created_at: DateTime<Utc>,
    /// When the host was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A compute host that runs benches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Hostname.
    pub name: ServerId,
    /// Operational status.
    pub status: HostStatus,
    /// Public address.
    pub ip: Option<String>,
    /// Private network address.
    pub private_ip: Option<String>,
    /// Proxy server fronting this host.
    pub proxy_server: ProxyServerId,
    /// Result of the last health observation.
    pub reachable: bool,
    /// When the host last answered a health check.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// When the host was registered.
    pub created_at: DateTime<Utc>,
    /// When the host was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An application source pinned at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    /// App name.
    pub name: AppId,
    /// Source repository URL.
    pub repository: String,
    /// Branch the version was taken from.
    pub branch: String,
    /// Commit hash the app is pinned at.
    pub hash: String,
    /// When the app was recorded.
    pub created_at: DateTime<Utc>,
}

/// Template from which deploy candidates are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseGroupRecord {
    /// Group name.
    pub name: ReleaseGroupId,
    /// Apps in install order.
    pub apps: Vec<AppId>,
    /// Disabled groups cannot produce new candidates.
    pub enabled: bool,
    /// Set once a candidate has been taken; the app list is fixed afterwards.
    pub frozen: bool,
    /// Free-form deploy configuration handed to benches.
    pub config: serde_json::Value,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
    /// When the group was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One app version captured by a deploy candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSnapshot {
    /// App name.
    pub app: AppId,
    /// Source repository URL.
    pub repository: String,
    /// Branch.
    pub branch: String,
    /// Commit hash.
    pub hash: String,
}

impl From<&AppRecord> for AppSnapshot {
    fn from(app: &AppRecord) -> Self {
        Self {
            app: app.name.clone(),
            repository: app.repository.clone(),
            branch: app.branch.clone(),
            hash: app.hash.clone(),
        }
    }
}

/// Immutable snapshot of a release group's apps, plus its build outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployCandidateRecord {
    /// Candidate identifier.
    pub id: DeployCandidateId,
    /// Group the snapshot was taken from.
    pub group: ReleaseGroupId,
    /// App versions in group order.
    pub apps: Vec<AppSnapshot>,
    /// Host the build runs on.
    pub build_server: ServerId,
    /// Build status.
    pub status: CandidateStatus,
    /// Build job, once submitted.
    pub job: Option<AgentJobId>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// When the candidate was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeployCandidateRecord {
    /// Check whether the candidate snapshot includes an app.
    #[must_use]
    pub fn contains_app(&self, app: &AppId) -> bool {
        self.apps.iter().any(|snapshot| &snapshot.app == app)
    }
}

/// A deployed runtime binding one candidate to one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchRecord {
    /// Bench name.
    pub name: BenchId,
    /// Release group of the deployed candidate.
    pub group: ReleaseGroupId,
    /// Deployed candidate.
    pub candidate: DeployCandidateId,
    /// Host server.
    pub server: ServerId,
    /// Background worker processes.
    pub workers: u32,
    /// Web worker processes.
    pub gunicorn_workers: u32,
    /// Bench status.
    pub status: BenchStatus,
    /// Outstanding job gating the bench's next transition.
    pub active_job: Option<AgentJobId>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the bench was created.
    pub created_at: DateTime<Utc>,
    /// When the bench was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Pricing and resource tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    /// Plan name.
    pub name: PlanId,
    /// Price in USD per period.
    pub price_usd: f64,
    /// Price in INR per period.
    pub price_inr: f64,
    /// Billing period in days.
    pub period: u32,
    /// When the plan was recorded.
    pub created_at: DateTime<Utc>,
}

/// Site fields shared across every lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteData {
    /// Fully qualified site name, also its default domain.
    pub name: SiteId,
    /// Subdomain the name was built from.
    pub subdomain: String,
    /// Hosting bench.
    pub bench: BenchId,
    /// Server of the hosting bench.
    pub server: ServerId,
    /// Plan the site is billed on.
    pub plan: PlanId,
    /// Installed apps.
    pub apps: Vec<AppId>,
    /// The single in-flight lifecycle job, if any.
    pub active_job: Option<AgentJobId>,
    /// Failure reason of the last lifecycle job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the site was created.
    pub created_at: DateTime<Utc>,
    /// When the site was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A site as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    /// The site data.
    #[serde(flatten)]
    pub data: SiteData,
    /// Current lifecycle status.
    pub status: SiteStatus,
}

impl SiteRecord {
    /// Site name.
    #[must_use]
    pub const fn name(&self) -> &SiteId {
        &self.data.name
    }
}

/// A custom hostname bound to a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDomainRecord {
    /// Hostname.
    pub name: DomainId,
    /// Owning site.
    pub site: SiteId,
    /// Whether this hostname is the site's primary name.
    pub primary: bool,
    /// When the domain was added.
    pub created_at: DateTime<Utc>,
    /// When the domain was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One dispatched remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJobRecord {
    /// Job identifier.
    pub id: AgentJobId,
    /// Remote operation.
    pub job_type: JobType,
    /// Hostname of the agent that runs the job.
    pub host: String,
    /// Agent endpoint path.
    pub path: String,
    /// HTTP method for the agent call.
    pub method: String,
    /// Job payload as stored (secrets redacted).
    pub payload: serde_json::Value,
    /// Named file blobs sent alongside the payload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Entity whose transition the job gates.
    pub target: JobTarget,
    /// Agent-side job identifier, once delivered.
    pub remote_id: Option<String>,
    /// Job status.
    pub status: JobStatus,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output reported by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Time after which the job is timed out.
    pub deadline: DateTime<Utc>,
    /// When the job was recorded.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}
