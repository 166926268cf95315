//! Identifiers and persisted status values for harbour-control.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from an existing value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

string_id!(
    /// Hostname of a compute server.
    ServerId
);
string_id!(
    /// Hostname of a proxy server.
    ProxyServerId
);
string_id!(
    /// Name of an application source.
    AppId
);
string_id!(
    /// Name of a release group.
    ReleaseGroupId
);
string_id!(
    /// Generated identifier of a deploy candidate.
    DeployCandidateId
);
string_id!(
    /// Name of a bench.
    BenchId
);
string_id!(
    /// Name of a plan.
    PlanId
);
string_id!(
    /// Fully qualified site name (`<subdomain>.<root domain>`).
    SiteId
);
string_id!(
    /// Custom hostname bound to a site.
    DomainId
);
string_id!(
    /// Generated identifier of an agent job.
    AgentJobId
);

impl DeployCandidateId {
    /// Generate a new unique candidate ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl AgentJobId {
    /// Generate a new unique job ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

/// Operational status of a server or proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Host accepts new work.
    Active,
    /// Host is retired or drained.
    Inactive,
}

impl HostStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("unknown host status: {s}")),
        }
    }
}

/// Build status of a deploy candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Snapshot taken, build not started.
    Pending,
    /// Build job submitted.
    Building,
    /// Artifact assembled; never mutated again.
    Built,
    /// Build failed; terminal.
    Failed,
}

impl CandidateStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Built => "built",
            Self::Failed => "failed",
        }
    }

    /// Check if the candidate can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Built | Self::Failed)
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "built" => Ok(Self::Built),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown candidate status: {s}")),
        }
    }
}

/// Status of a bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchStatus {
    /// Bench recorded, `new_bench` job outstanding.
    Pending,
    /// Bench deployed and able to host sites.
    Active,
    /// Deployment or archival failed.
    Broken,
    /// Bench removed from its server.
    Archived,
}

impl BenchStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Broken => "broken",
            Self::Archived => "archived",
        }
    }

    /// Whether the bench counts against its server's capacity.
    #[must_use]
    pub const fn occupies_capacity(&self) -> bool {
        !matches!(self, Self::Archived)
    }
}

impl fmt::Display for BenchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "broken" => Ok(Self::Broken),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown bench status: {s}")),
        }
    }
}

/// Persisted lifecycle status of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    /// Site recorded, install job not yet delivered.
    Pending,
    /// Install or restore running on the agent.
    Installing,
    /// Site is live.
    Active,
    /// Site deactivated by its owner.
    Inactive,
    /// Site suspended by the platform.
    Suspended,
    /// A lifecycle job failed.
    Broken,
    /// Site removed; terminal.
    Archived,
}

impl SiteStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
            Self::Broken => "broken",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            "broken" => Ok(Self::Broken),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown site status: {s}")),
        }
    }
}

/// Status of an agent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded but not yet accepted by the agent.
    Undelivered,
    /// Accepted by the agent, outcome pending.
    Delivered,
    /// Remote operation succeeded.
    Success,
    /// Remote operation failed or was rejected.
    Failure,
    /// No outcome before the deadline.
    Timeout,
}

impl JobStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Undelivered => "undelivered",
            Self::Delivered => "delivered",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }

    /// Check if the job has a final outcome.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undelivered" => Ok(Self::Undelivered),
            "delivered" => Ok(Self::Delivered),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("unknown job status: {s}")),
        }
    }
}

/// Remote operation carried by an agent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Assemble a deploy candidate's artifact on the builder host.
    BuildCandidate,
    /// Deploy a bench onto a server.
    NewBench,
    /// Remove a bench from its server.
    ArchiveBench,
    /// Install a new site on its bench.
    NewSite,
    /// Route the site to the suspended page.
    SuspendSite,
    /// Lift a suspension.
    UnsuspendSite,
    /// Route the site to the inactive page.
    DeactivateSite,
    /// Lift a deactivation.
    ActivateSite,
    /// Restore a site from a backup.
    RestoreSite,
    /// Drop a site from its bench.
    ArchiveSite,
}

impl JobType {
    /// Get the job type name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BuildCandidate => "build_candidate",
            Self::NewBench => "new_bench",
            Self::ArchiveBench => "archive_bench",
            Self::NewSite => "new_site",
            Self::SuspendSite => "suspend_site",
            Self::UnsuspendSite => "unsuspend_site",
            Self::DeactivateSite => "deactivate_site",
            Self::ActivateSite => "activate_site",
            Self::RestoreSite => "restore_site",
            Self::ArchiveSite => "archive_site",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_candidate" => Ok(Self::BuildCandidate),
            "new_bench" => Ok(Self::NewBench),
            "archive_bench" => Ok(Self::ArchiveBench),
            "new_site" => Ok(Self::NewSite),
            "suspend_site" => Ok(Self::SuspendSite),
            "unsuspend_site" => Ok(Self::UnsuspendSite),
            "deactivate_site" => Ok(Self::DeactivateSite),
            "activate_site" => Ok(Self::ActivateSite),
            "restore_site" => Ok(Self::RestoreSite),
            "archive_site" => Ok(Self::ArchiveSite),
            _ => Err(format!("unknown job type: {s}")),
        }
    }
}

/// The entity whose transition an agent job gates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobTarget {
    /// A deploy candidate being built.
    DeployCandidate(DeployCandidateId),
    /// A bench being deployed or archived.
    Bench(BenchId),
    /// A site lifecycle change.
    Site(SiteId),
}

impl JobTarget {
    /// Kind of the target, used to route completions.
    #[must_use]
    pub const fn kind(&self) -> TargetKind {
        match self {
            Self::DeployCandidate(_) => TargetKind::DeployCandidate,
            Self::Bench(_) => TargetKind::Bench,
            Self::Site(_) => TargetKind::Site,
        }
    }

    /// Identifier of the target as a string slice.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::DeployCandidate(id) => id.as_str(),
            Self::Bench(id) => id.as_str(),
            Self::Site(id) => id.as_str(),
        }
    }

    /// Rebuild a target from its persisted kind and id.
    pub fn from_parts(kind: &str, id: impl Into<String>) -> Result<Self, String> {
        match kind.parse::<TargetKind>()? {
            TargetKind::DeployCandidate => Ok(Self::DeployCandidate(DeployCandidateId::new(id))),
            TargetKind::Bench => Ok(Self::Bench(BenchId::new(id))),
            TargetKind::Site => Ok(Self::Site(SiteId::new(id))),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// Kind of entity a job can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Deploy candidates (release pipeline).
    DeployCandidate,
    /// Benches (bench manager).
    Bench,
    /// Sites (site state machine).
    Site,
}

impl TargetKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeployCandidate => "deploy_candidate",
            Self::Bench => "bench",
            Self::Site => "site",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy_candidate" => Ok(Self::DeployCandidate),
            "bench" => Ok(Self::Bench),
            "site" => Ok(Self::Site),
            _ => Err(format!("unknown job target kind: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_lowercase() {
        let a = AgentJobId::generate();
        let b = AgentJobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), a.as_str().to_lowercase());
    }

    #[test]
    fn status_names_parse_back() {
        for status in [
            SiteStatus::Pending,
            SiteStatus::Installing,
            SiteStatus::Active,
            SiteStatus::Inactive,
            SiteStatus::Suspended,
            SiteStatus::Broken,
            SiteStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<SiteStatus>(), Ok(status));
        }
        assert!("deleted".parse::<SiteStatus>().is_err());
    }

    #[test]
    fn job_target_serialises_with_kind_tag() {
        let target = JobTarget::Site(SiteId::new("acme.harbour.test"));
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "site", "id": "acme.harbour.test"})
        );

        let rebuilt = JobTarget::from_parts("site", "acme.harbour.test").unwrap();
        assert_eq!(rebuilt, target);
        assert!(JobTarget::from_parts("plan", "gold").is_err());
    }

    #[test]
    fn terminal_job_statuses() {
        assert!(!JobStatus::Undelivered.is_terminal());
        assert!(!JobStatus::Delivered.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
    }
}
