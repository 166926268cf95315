//! HTTP API for the control plane.
//!
//! Provides endpoints for:
//! - Host registration and status
//! - Apps, release groups, plans and deploy candidates
//! - Benches, sites, site lifecycle and domains
//! - Agent job queries and outcome callbacks
//! - Health, readiness and Prometheus metrics

mod callbacks;
mod hosts;
mod releases;
mod sites;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::control::ControlPlane;
use crate::error::ControlError;
use crate::store::{JobFilter, SiteFilter};
use crate::types::{JobStatus, SiteStatus};

pub use callbacks::JobCallback;
pub use hosts::ServerStatusRequest;
pub use sites::{AddDomainRequest, SetPrimaryRequest};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// The control plane every handler works through.
    pub plane: Arc<ControlPlane>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        // Hosts
        .route("/proxy-servers", post(hosts::register_proxy_server))
        .route("/servers", post(hosts::register_server).get(hosts::list_servers))
        .route("/servers/{name}", get(hosts::get_server))
        .route("/servers/{name}/status", put(hosts::set_server_status))
        // Releases
        .route("/apps", post(releases::upsert_app))
        .route("/release-groups", post(releases::upsert_release_group))
        .route("/release-groups/{name}/apps", post(releases::add_app))
        .route(
            "/release-groups/{name}/deploy-candidates",
            post(releases::create_deploy_candidate).get(releases::list_candidates),
        )
        .route("/deploy-candidates/{id}", get(releases::get_candidate))
        // Benches and sites
        .route("/plans", post(sites::upsert_plan))
        .route("/benches", post(sites::create_bench))
        .route("/benches/{name}", get(sites::get_bench))
        .route("/benches/{name}/archive", post(sites::archive_bench))
        .route("/sites", post(sites::create_site).get(sites::list_sites))
        .route("/sites/{name}", get(sites::get_site))
        .route("/sites/{name}/primary-domain", get(sites::primary_domain))
        .route(
            "/sites/{name}/domains",
            post(sites::add_domain).get(sites::list_domains),
        )
        .route("/sites/{name}/{action}", post(sites::transition_site))
        .route(
            "/domains/{name}",
            put(sites::set_primary).delete(sites::remove_domain),
        )
        // Agent jobs
        .route("/jobs/{id}", get(callbacks::get_job))
        .route("/agent/callbacks", post(callbacks::job_callback))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Result type for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
        ControlError::DependencyNotReady { .. }
        | ControlError::StateConflict { .. }
        | ControlError::InvalidStateTransition { .. }
        | ControlError::InvariantViolation(_) => StatusCode::CONFLICT,
        ControlError::Capacity { .. } => StatusCode::INSUFFICIENT_STORAGE,
        ControlError::AgentDispatch(_) | ControlError::AgentExecution(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a control error into an HTTP error response.
pub(crate) fn reject(error: ControlError) -> ApiError {
    (
        error_to_status(&error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.plane.registry().servers().await {
        Ok(servers) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                servers: servers.len(),
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                servers: 0,
            }),
        ),
    }
}

const SITE_STATUSES: [SiteStatus; 7] = [
    SiteStatus::Pending,
    SiteStatus::Installing,
    SiteStatus::Active,
    SiteStatus::Inactive,
    SiteStatus::Suspended,
    SiteStatus::Broken,
    SiteStatus::Archived,
];

const JOB_STATUSES: [JobStatus; 5] = [
    JobStatus::Undelivered,
    JobStatus::Delivered,
    JobStatus::Success,
    JobStatus::Failure,
    JobStatus::Timeout,
];

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();
    let store = state.plane.store();

    output.push_str("# HELP harbour_sites_total Number of sites by status\n");
    output.push_str("# TYPE harbour_sites_total gauge\n");
    for status in SITE_STATUSES {
        let count = store
            .list_sites(&SiteFilter::new().with_status(status))
            .await
            .map(|s| s.len())
            .unwrap_or(0);
        let _ = writeln!(output, "harbour_sites_total{{status=\"{status}\"}} {count}");
    }

    output.push_str("# HELP harbour_agent_jobs_total Number of agent jobs by status\n");
    output.push_str("# TYPE harbour_agent_jobs_total gauge\n");
    for status in JOB_STATUSES {
        let count = store
            .list_jobs(&JobFilter::new().with_status(status))
            .await
            .map(|j| j.len())
            .unwrap_or(0);
        let _ = writeln!(
            output,
            "harbour_agent_jobs_total{{status=\"{status}\"}} {count}"
        );
    }

    output
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    servers: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::MockAgentClient;
    use crate::config::ControlConfig;
    use crate::error::EntityKind;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_app_state() -> AppState {
        let plane = ControlPlane::new(
            &ControlConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MockAgentClient::new()),
        )
        .unwrap();
        AppState {
            plane: Arc::new(plane),
        }
    }

    async fn get(uri: &str) -> axum::response::Response {
        router(make_app_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        assert_eq!(get("/health").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint() {
        assert_eq!(get("/ready").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let response = get("/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("harbour_sites_total{status=\"active\"} 0"));
        assert!(text.contains("harbour_agent_jobs_total{status=\"timeout\"} 0"));
    }

    #[tokio::test]
    async fn unknown_site_is_not_found() {
        assert_eq!(
            get("/sites/nope.harbour.local").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            error_to_status(&ControlError::validation("bad")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_to_status(&ControlError::StateConflict {
                kind: EntityKind::Site,
                id: "acme".to_owned(),
                job: "01j".to_owned(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_to_status(&ControlError::Capacity {
                server: "f1".to_owned(),
                benches: 2,
                limit: 2,
            }),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            error_to_status(&ControlError::AgentDispatch("down".to_owned())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_to_status(&ControlError::internal("lock poisoned")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
