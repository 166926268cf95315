//! Configuration for harbour-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Agent dispatch configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Release pipeline configuration.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Bench capacity configuration.
    #[serde(default)]
    pub capacity: CapacityConfig,

    /// Site naming configuration.
    #[serde(default)]
    pub sites: SitesConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `harbour.toml` in the current directory (if present)
    /// 3. Environment variables with `HARBOUR_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("harbour.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HARBOUR_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8084)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Fall back to the in-memory store when the database is unreachable.
    #[serde(default = "default_memory_fallback")]
    pub memory_fallback: bool,
}

fn default_database_url() -> String {
    "postgres://localhost/harbour".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_memory_fallback() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            memory_fallback: default_memory_fallback(),
        }
    }
}

/// Agent dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Which agent client to use.
    #[serde(default)]
    pub client: AgentClientKind,

    /// URL scheme for agent requests.
    #[serde(default = "default_agent_scheme")]
    pub scheme: String,

    /// Port the agents listen on.
    #[serde(default = "default_agent_port")]
    pub port: u16,

    /// Bearer token sent with every agent request.
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_agent_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Time a job may take, from submission to outcome, before it times out.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How often the reconciler polls open jobs (seconds).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl AgentConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Job deadline measured from submission.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Reconciler tick interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_agent_scheme() -> String {
    "https".to_owned()
}

const fn default_agent_port() -> u16 {
    443
}

const fn default_agent_request_timeout_secs() -> u64 {
    30
}

const fn default_job_timeout_secs() -> u64 {
    1800
}

const fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client: AgentClientKind::default(),
            scheme: default_agent_scheme(),
            port: default_agent_port(),
            token: None,
            request_timeout_secs: default_agent_request_timeout_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Type of agent client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentClientKind {
    /// HTTP client talking to real agents.
    #[default]
    Http,

    /// In-process mock for testing.
    Mock,
}

/// Release pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseConfig {
    /// Server that runs deploy candidate builds.
    #[serde(default)]
    pub builder_server: Option<String>,
}

/// Bench capacity configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapacityConfig {
    /// Benches a single server may hold; unset means unlimited.
    #[serde(default)]
    pub max_benches_per_server: Option<u32>,
}

/// Site naming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SitesConfig {
    /// Domain appended to a subdomain to form a site name.
    #[serde(default = "default_root_domain")]
    pub root_domain: String,
}

fn default_root_domain() -> String {
    "harbour.local".to_owned()
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            root_domain: default_root_domain(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ControlConfig::default();
        assert_eq!(config.server.listen.port(), 8084);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.agent.client, AgentClientKind::Http);
        assert_eq!(config.agent.port, 443);
        assert_eq!(config.agent.job_timeout(), Duration::from_secs(1800));
        assert!(config.release.builder_server.is_none());
        assert!(config.capacity.max_benches_per_server.is_none());
        assert_eq!(config.sites.root_domain, "harbour.local");
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [database]
            url = "postgres://user:pass@db:5432/harbour"
            memory_fallback = false

            [agent]
            client = "mock"
            token = "secret"
            poll_interval_secs = 1

            [release]
            builder_server = "build.harbour.test"

            [capacity]
            max_benches_per_server = 4

            [sites]
            root_domain = "harbour.test"
        "#;

        let config: ControlConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.database.url, "postgres://user:pass@db:5432/harbour");
        assert!(!config.database.memory_fallback);
        assert_eq!(config.agent.client, AgentClientKind::Mock);
        assert_eq!(config.agent.token.as_deref(), Some("secret"));
        assert_eq!(config.agent.poll_interval(), Duration::from_secs(1));
        assert_eq!(
            config.release.builder_server.as_deref(),
            Some("build.harbour.test")
        );
        assert_eq!(config.capacity.max_benches_per_server, Some(4));
        assert_eq!(config.sites.root_domain, "harbour.test");
    }
}
