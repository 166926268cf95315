//! In-process agent client for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::types::JobType;

use super::{AgentClient, AgentError, DeliveryRequest, RemoteJob, RemoteStatus};

/// How the mock agent treats jobs of a given type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockBehaviour {
    /// Accept the job; it succeeds on the first status query.
    #[default]
    Succeed,
    /// Accept the job; it fails with the message on the first status query.
    Fail(String),
    /// Refuse the job at submission.
    Reject(String),
    /// Fail to connect at submission.
    Unreachable,
    /// Accept the job; it never leaves the running state.
    NeverRespond,
}

#[derive(Debug, Default)]
struct MockState {
    behaviours: HashMap<JobType, MockBehaviour>,
    jobs: HashMap<String, MockBehaviour>,
    submissions: Vec<DeliveryRequest>,
}

/// Mock agent client for testing.
///
/// Behaviour is scripted per job type and captured at submission, so
/// changing a behaviour later does not affect jobs already accepted.
#[derive(Debug, Default)]
pub struct MockAgentClient {
    state: RwLock<MockState>,
    next_id: AtomicU64,
}

impl MockAgentClient {
    /// Create a mock whose jobs all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour for a job type.
    pub fn set_behaviour(&self, job_type: JobType, behaviour: MockBehaviour) {
        if let Ok(mut state) = self.state.write() {
            state.behaviours.insert(job_type, behaviour);
        }
    }

    /// Every request handed to the mock, in submission order.
    #[must_use]
    pub fn submissions(&self) -> Vec<DeliveryRequest> {
        self.state
            .read()
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    /// Requests of one job type, in submission order.
    #[must_use]
    pub fn submissions_of(&self, job_type: JobType) -> Vec<DeliveryRequest> {
        self.submissions()
            .into_iter()
            .filter(|r| r.job_type == job_type)
            .collect()
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    async fn submit(&self, request: &DeliveryRequest) -> Result<String, AgentError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| AgentError::Unreachable("lock poisoned".to_owned()))?;

        state.submissions.push(request.clone());
        let behaviour = state
            .behaviours
            .get(&request.job_type)
            .cloned()
            .unwrap_or_default();

        match behaviour {
            MockBehaviour::Reject(reason) => Err(AgentError::Rejected(reason)),
            MockBehaviour::Unreachable => Err(AgentError::Unreachable(format!(
                "connection refused: {}",
                request.address
            ))),
            accepted => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let remote_id = id.to_string();
                state.jobs.insert(remote_id.clone(), accepted);
                Ok(remote_id)
            }
        }
    }

    async fn query_status(&self, _address: &str, remote_id: &str) -> Result<RemoteJob, AgentError> {
        let state = self
            .state
            .read()
            .map_err(|_| AgentError::Unreachable("lock poisoned".to_owned()))?;

        let behaviour = state
            .jobs
            .get(remote_id)
            .ok_or_else(|| AgentError::Rejected(format!("unknown job: {remote_id}")))?;

        let (status, output, error) = match behaviour {
            MockBehaviour::Succeed => (
                RemoteStatus::Success,
                Some(serde_json::json!({"job": remote_id})),
                None,
            ),
            MockBehaviour::Fail(reason) => (RemoteStatus::Failure, None, Some(reason.clone())),
            _ => (RemoteStatus::Running, None, None),
        };

        Ok(RemoteJob {
            id: remote_id.to_owned(),
            status,
            output,
            error,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::AgentJobId;

    fn request(job_type: JobType) -> DeliveryRequest {
        DeliveryRequest {
            job_id: AgentJobId::generate(),
            job_type,
            address: "10.0.0.5".to_owned(),
            path: "benches".to_owned(),
            method: "POST".to_owned(),
            data: serde_json::json!({}),
            files: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn scripted_behaviours() {
        let mock = MockAgentClient::new();
        mock.set_behaviour(JobType::NewBench, MockBehaviour::Fail("no disk".to_owned()));
        mock.set_behaviour(JobType::NewSite, MockBehaviour::Reject("bad name".to_owned()));
        mock.set_behaviour(JobType::ArchiveSite, MockBehaviour::Unreachable);

        let ok = mock.submit(&request(JobType::BuildCandidate)).await.unwrap();
        let status = mock.query_status("10.0.0.5", &ok).await.unwrap();
        assert_eq!(status.status, RemoteStatus::Success);

        let failing = mock.submit(&request(JobType::NewBench)).await.unwrap();
        let status = mock.query_status("10.0.0.5", &failing).await.unwrap();
        assert_eq!(status.status, RemoteStatus::Failure);
        assert_eq!(status.error.as_deref(), Some("no disk"));

        assert!(matches!(
            mock.submit(&request(JobType::NewSite)).await,
            Err(AgentError::Rejected(_))
        ));
        assert!(matches!(
            mock.submit(&request(JobType::ArchiveSite)).await,
            Err(AgentError::Unreachable(_))
        ));

        assert_eq!(mock.submissions().len(), 4);
        assert_eq!(mock.submissions_of(JobType::NewSite).len(), 1);
    }

    #[tokio::test]
    async fn behaviour_is_captured_at_submission() {
        let mock = MockAgentClient::new();
        mock.set_behaviour(JobType::RestoreSite, MockBehaviour::NeverRespond);
        let id = mock.submit(&request(JobType::RestoreSite)).await.unwrap();

        mock.set_behaviour(JobType::RestoreSite, MockBehaviour::Succeed);
        let status = mock.query_status("10.0.0.5", &id).await.unwrap();
        assert_eq!(status.status, RemoteStatus::Running);
    }
}
