//! Error types for harbour-control.

use std::fmt;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
///
/// The first group of variants is raised synchronously, before any record
/// is written or any agent job is queued. `AgentDispatch` and
/// `AgentExecution` describe failures of work that was already recorded;
/// they end up on the owning entity's `error` field rather than being
/// returned to the caller that started the work.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Malformed or missing required input.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (site, bench, ...).
        kind: EntityKind,
        /// Identifier that was looked up.
        id: String,
    },

    /// A required upstream entity is not in its required state.
    #[error("{kind} {id} is {state}, expected {required}")]
    DependencyNotReady {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: String,
        /// Current state.
        state: String,
        /// Required state.
        required: &'static str,
    },

    /// The target host has no room for another bench.
    #[error("capacity exhausted on {server}: {benches} of {limit} benches in use")]
    Capacity {
        /// Server name.
        server: String,
        /// Benches currently counted against the server.
        benches: u32,
        /// Configured limit.
        limit: u32,
    },

    /// Another lifecycle operation is already in flight for the entity.
    #[error("{kind} {id} has job {job} in flight")]
    StateConflict {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: String,
        /// The outstanding job.
        job: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// A write or read would break a data invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An agent job could not be delivered.
    #[error("agent dispatch error: {0}")]
    AgentDispatch(String),

    /// An agent job was delivered but the remote operation failed.
    #[error("agent execution error: {0}")]
    AgentExecution(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: EntityKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a dependency-not-ready error.
    #[must_use]
    pub fn not_ready(
        kind: EntityKind,
        id: impl fmt::Display,
        state: impl fmt::Display,
        required: &'static str,
    ) -> Self {
        Self::DependencyNotReady {
            kind,
            id: id.to_string(),
            state: state.to_string(),
            required,
        }
    }

    /// Create an invariant violation.
    #[must_use]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true for errors raised before any state was written.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound { .. }
                | Self::DependencyNotReady { .. }
                | Self::Capacity { .. }
                | Self::StateConflict { .. }
                | Self::InvalidStateTransition { .. }
                | Self::InvariantViolation(_)
        )
    }
}

/// Kind of entity named in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Compute host.
    Server,
    /// Front-facing router host.
    ProxyServer,
    /// Application source reference.
    App,
    /// Release group template.
    ReleaseGroup,
    /// Built artifact snapshot.
    DeployCandidate,
    /// Deployed runtime environment.
    Bench,
    /// Pricing tier.
    Plan,
    /// Tenant instance.
    Site,
    /// Custom hostname.
    SiteDomain,
    /// Dispatched remote operation.
    AgentJob,
}

impl EntityKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::ProxyServer => "proxy server",
            Self::App => "app",
            Self::ReleaseGroup => "release group",
            Self::DeployCandidate => "deploy candidate",
            Self::Bench => "bench",
            Self::Plan => "plan",
            Self::Site => "site",
            Self::SiteDomain => "site domain",
            Self::AgentJob => "agent job",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
