//! HTTP client for the host agent API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;

use crate::config::AgentConfig;
use crate::error::{ControlError, ControlResult};

use super::{AgentClient, AgentError, DeliveryRequest, RemoteJob};

/// Response to a job submission.
#[derive(Deserialize)]
struct Accepted {
    #[serde(deserialize_with = "super::deserialize_remote_id")]
    job: String,
}

/// HTTP client for host agents.
///
/// Jobs are posted to `<scheme>://<host>:<port>/agent/<path>`; their status
/// is read back from `/agent/jobs/<id>` on the same host.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
    scheme: String,
    port: u16,
    token: Option<String>,
}

impl HttpAgentClient {
    /// Create a new agent client from configuration.
    pub fn new(config: &AgentConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            scheme: config.scheme.trim_end_matches("://").to_owned(),
            port: config.port,
            token: config.token.clone(),
        })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!(
            "{}://{}:{}/agent/{}",
            self.scheme,
            address,
            self.port,
            path.trim_start_matches('/')
        )
    }

    fn authorise(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AgentError> {
        let response = self
            .authorise(request)
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(AgentError::Rejected(format!("{status}: {body}")))
        } else {
            Err(AgentError::Unreachable(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn submit(&self, request: &DeliveryRequest) -> Result<String, AgentError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AgentError::Rejected(format!("invalid method: {}", request.method)))?;

        let mut body = serde_json::json!({
            "job_type": request.job_type.as_str(),
            "data": request.data,
        });
        if !request.files.is_empty() {
            body["files"] = serde_json::json!(request.files);
        }

        let url = self.url(&request.address, &request.path);
        let response = self
            .send(self.client.request(method, &url).json(&body))
            .await?;

        let accepted: Accepted = response
            .json()
            .await
            .map_err(|e| AgentError::Rejected(format!("malformed acceptance: {e}")))?;

        Ok(accepted.job)
    }

    async fn query_status(&self, address: &str, remote_id: &str) -> Result<RemoteJob, AgentError> {
        let url = self.url(address, &format!("jobs/{remote_id}"));
        let response = self.send(self.client.get(&url)).await?;

        response
            .json()
            .await
            .map_err(|e| AgentError::Unreachable(format!("malformed job status: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        let config = AgentConfig::default();
        let client = HttpAgentClient::new(&config);
        assert!(client.is_ok());
    }

    #[test]
    fn urls_use_configured_scheme_and_port() {
        let config = AgentConfig {
            scheme: "http://".to_owned(),
            port: 25052,
            ..AgentConfig::default()
        };
        let client = HttpAgentClient::new(&config).unwrap();

        assert_eq!(
            client.url("10.0.0.5", "benches/bench-a/sites"),
            "http://10.0.0.5:25052/agent/benches/bench-a/sites"
        );
        assert_eq!(
            client.url("10.0.0.5", "/jobs/17"),
            "http://10.0.0.5:25052/agent/jobs/17"
        );
    }

    #[tokio::test]
    async fn unreachable_agent_is_retryable() {
        let config = AgentConfig {
            scheme: "http".to_owned(),
            port: 1,
            request_timeout_secs: 1,
            ..AgentConfig::default()
        };
        let client = HttpAgentClient::new(&config).unwrap();

        let result = client.query_status("127.0.0.1", "1").await;
        assert!(matches!(result, Err(AgentError::Unreachable(_))));
    }
}
