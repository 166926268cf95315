//! Agent job endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent::RemoteStatus;
use crate::records::AgentJobRecord;
use crate::types::AgentJobId;

use super::{reject, ApiResult, AppState};

/// Outcome pushed by an agent when a job finishes.
#[derive(Debug, Deserialize)]
pub struct JobCallback {
    /// Control-plane job ID.
    pub job: AgentJobId,
    /// Final status.
    pub status: RemoteStatus,
    /// Output, for successful jobs.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Error message, for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
}

/// Response to an outcome callback.
#[derive(Debug, Serialize)]
pub struct JobCallbackResponse {
    /// False when the job already had an outcome.
    pub accepted: bool,
}

/// Get an agent job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentJobRecord>> {
    let job = state
        .plane
        .dispatcher()
        .job(&AgentJobId::new(id))
        .await
        .map_err(reject)?;
    Ok(Json(job))
}

/// Record an outcome pushed by an agent.
pub async fn job_callback(
    State(state): State<AppState>,
    Json(callback): Json<JobCallback>,
) -> ApiResult<(StatusCode, Json<JobCallbackResponse>)> {
    info!(
        job_id = %callback.job,
        status = ?callback.status,
        "received agent job callback"
    );

    let accepted = state
        .plane
        .dispatcher()
        .record_outcome(
            &callback.job,
            callback.status,
            callback.output,
            callback.error,
        )
        .await
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(JobCallbackResponse { accepted })))
}
