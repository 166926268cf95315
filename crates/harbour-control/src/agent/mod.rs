//! Remote agent job dispatch.
//!
//! Every state-changing operation on a host runs as an agent job. The
//! [`JobDispatcher`] records each job, hands it to an [`AgentClient`] and
//! reports outcomes back to the component that issued it through a
//! [`JobCompletionHandler`].

mod dispatcher;
mod http;
mod mock;

pub use dispatcher::{
    JobCompletionHandler, JobDispatcher, JobHandle, JobRequest, ReconcileReport, REDACTED,
};
pub use http::HttpAgentClient;
pub use mock::{MockAgentClient, MockBehaviour};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgentClientKind, AgentConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{AgentJobId, JobStatus, JobType};

/// Errors reported by an agent client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent could not be reached; delivery may be retried.
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The agent refused the job; retrying will not help.
    #[error("agent rejected job: {0}")]
    Rejected(String),

    /// The job produced no outcome before its deadline.
    #[error("job timed out: {0}")]
    Timeout(String),
}

impl From<AgentError> for ControlError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Unreachable(_) | AgentError::Rejected(_) => {
                Self::AgentDispatch(err.to_string())
            }
            AgentError::Timeout(_) => Self::AgentExecution(err.to_string()),
        }
    }
}

/// A job as handed to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    /// Control-plane job ID.
    pub job_id: AgentJobId,
    /// Remote operation.
    pub job_type: JobType,
    /// Network address of the agent host.
    pub address: String,
    /// Agent endpoint path.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Job payload, secrets included.
    pub data: serde_json::Value,
    /// Named file blobs.
    pub files: BTreeMap<String, String>,
}

/// Status of a job as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    /// Queued on the agent.
    Pending,
    /// Running on the agent.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
}

/// Job state returned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// Agent-side job ID.
    #[serde(deserialize_with = "deserialize_remote_id")]
    pub id: String,
    /// Job status.
    pub status: RemoteStatus,
    /// Output, if the job produced any.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Error message for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
}

/// Agents report job IDs as integers or strings.
pub(crate) fn deserialize_remote_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected job id, got {other}"
        ))),
    }
}

/// Final outcome of an agent job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The remote operation succeeded.
    Success(Option<serde_json::Value>),
    /// The remote operation failed.
    Failure(String),
    /// The job never reached an agent that would run it.
    Undeliverable(String),
    /// No outcome before the deadline.
    Timeout,
}

impl JobOutcome {
    /// The job status this outcome records.
    #[must_use]
    pub const fn status(&self) -> JobStatus {
        match self {
            Self::Success(_) => JobStatus::Success,
            Self::Failure(_) | Self::Undeliverable(_) => JobStatus::Failure,
            Self::Timeout => JobStatus::Timeout,
        }
    }

    /// Returns true for a successful outcome.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Error message to store on the owning entity, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::Failure(msg) => Some(ControlError::AgentExecution(msg.clone()).to_string()),
            Self::Undeliverable(msg) => Some(ControlError::AgentDispatch(msg.clone()).to_string()),
            Self::Timeout => Some(
                ControlError::from(AgentError::Timeout(
                    "no outcome before the job deadline".to_owned(),
                ))
                .to_string(),
            ),
        }
    }
}

/// Capability for talking to host agents.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Hand a job to an agent, returning the agent-side job ID.
    async fn submit(&self, request: &DeliveryRequest) -> Result<String, AgentError>;

    /// Ask an agent for the state of a job it accepted.
    async fn query_status(&self, address: &str, remote_id: &str) -> Result<RemoteJob, AgentError>;
}

/// Create an agent client from configuration.
pub fn create_agent_client(config: &AgentConfig) -> ControlResult<Arc<dyn AgentClient>> {
    match config.client {
        AgentClientKind::Http => Ok(Arc::new(HttpAgentClient::new(config)?)),
        AgentClientKind::Mock => Ok(Arc::new(MockAgentClient::default())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn remote_job_accepts_numeric_ids() {
        let job: RemoteJob =
            serde_json::from_str(r#"{"id": 42, "status": "Running"}"#).unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.status, RemoteStatus::Running);

        let job: RemoteJob = serde_json::from_str(
            r#"{"id": "a7", "status": "Failure", "error": "bench missing"}"#,
        )
        .unwrap();
        assert_eq!(job.id, "a7");
        assert_eq!(job.error.as_deref(), Some("bench missing"));
    }

    #[test]
    fn outcome_errors_describe_failure() {
        assert!(JobOutcome::Success(None).error().is_none());
        assert_eq!(
            JobOutcome::Failure("disk full".to_owned()).error().as_deref(),
            Some("agent execution error: disk full")
        );
        let rejected = JobOutcome::Undeliverable("agent rejected job: bench is full".to_owned());
        assert_eq!(rejected.status(), JobStatus::Failure);
        assert_eq!(
            rejected.error().as_deref(),
            Some("agent dispatch error: agent rejected job: bench is full")
        );
        let timeout = JobOutcome::Timeout.error().unwrap();
        assert!(timeout.contains("timed out"));
        assert_eq!(JobOutcome::Timeout.status(), JobStatus::Timeout);
    }

    #[test]
    fn agent_errors_map_to_control_errors() {
        let err: ControlError = AgentError::Rejected("bad payload".to_owned()).into();
        assert!(matches!(err, ControlError::AgentDispatch(_)));

        let err: ControlError = AgentError::Timeout("late".to_owned()).into();
        assert!(matches!(err, ControlError::AgentExecution(_)));
    }

    #[test]
    fn create_mock_client() {
        let config = AgentConfig {
            client: AgentClientKind::Mock,
            ..AgentConfig::default()
        };
        assert!(create_agent_client(&config).is_ok());
    }
}
