//! Harbour Control Plane
//!
//! This crate provisions and operates tenant sites on a fleet of hosts. It
//! coordinates application releases, compute capacity and remote agent jobs
//! to bring a site to a running, publicly reachable state.
//!
//! # Architecture
//!
//! - **Capacity registry**: servers, proxy servers and the per-server bench
//!   limit
//! - **Agent job dispatcher**: records remote jobs, delivers them and
//!   reconciles their outcomes
//! - **Release pipeline**: apps, release groups and deploy candidate builds
//! - **Bench manager**: runtime environments built from deploy candidates
//! - **Site state machine**: site creation and lifecycle
//! - **Domain resolver**: the hostname a site is served on
//!
//! Provisioning flows release → bench → site, each stage gated on the
//! previous one having succeeded:
//!
//! ```text
//! DeployCandidate (Built) ──▶ Bench (Active) ──▶ Site (Active)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use harbour_control::{ControlConfig, ControlPlane, MemoryStore, MockAgentClient};
//!
//! let plane = ControlPlane::new(
//!     &ControlConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MockAgentClient::new()),
//! )?;
//!
//! let site = plane.sites().create_site(request).await?;
//! let host = plane.domains().primary_domain_name(site.name()).await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod agent;
pub mod api;
pub mod bench;
pub mod config;
pub mod control;
pub mod domain;
pub mod error;
pub mod naming;
pub mod records;
pub mod registry;
pub mod release;
pub mod service;
pub mod site;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use agent::{
    AgentClient, AgentError, HttpAgentClient, JobCompletionHandler, JobDispatcher, JobOutcome,
    JobRequest, MockAgentClient, MockBehaviour,
};
pub use bench::{BenchManager, BenchRequest};
pub use config::ControlConfig;
pub use control::ControlPlane;
pub use domain::DomainResolver;
pub use error::{ControlError, ControlResult, EntityKind};
pub use registry::{CapacityPolicy, CapacityRegistry, FixedCapacity, ProxyServerSpec, ServerSpec};
pub use release::{AppSpec, ReleaseGroupSpec, ReleasePipeline};
pub use service::ControlService;
pub use site::{AnySite, PlanSpec, SiteAction, SiteManager, SiteRequest};
pub use store::{ControlStore, JobFilter, MemoryStore, PostgresStore, SiteFilter};
pub use types::{
    AgentJobId, AppId, BenchId, BenchStatus, CandidateStatus, DeployCandidateId, DomainId,
    HostStatus, JobStatus, JobTarget, JobType, PlanId, ProxyServerId, ReleaseGroupId, ServerId,
    SiteId, SiteStatus,
};
