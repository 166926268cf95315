//! Plan, bench, site and domain endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bench::BenchRequest;
use crate::error::ControlError;
use crate::records::{BenchRecord, PlanRecord, SiteDomainRecord, SiteRecord};
use crate::site::{PlanSpec, SiteAction, SiteRequest};
use crate::store::SiteFilter;
use crate::types::{BenchId, DomainId, SiteId, SiteStatus};

use super::{reject, ApiResult, AppState};

/// Query parameters for listing sites.
#[derive(Debug, Default, Deserialize)]
pub struct ListSitesQuery {
    /// Filter by bench.
    pub bench: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

/// Request to bind a domain to a site.
#[derive(Debug, Deserialize)]
pub struct AddDomainRequest {
    /// Hostname to bind.
    pub domain: String,
    /// Whether the domain becomes the site's primary.
    #[serde(default)]
    pub primary: bool,
}

/// Request to flag or unflag a primary domain.
#[derive(Debug, Deserialize)]
pub struct SetPrimaryRequest {
    /// New primary flag.
    pub primary: bool,
}

/// Hostname a site is served on.
#[derive(Debug, Serialize)]
pub struct PrimaryDomainResponse {
    /// Site name.
    pub site: String,
    /// Effective hostname.
    pub domain: String,
}

/// Store a plan.
pub async fn upsert_plan(
    State(state): State<AppState>,
    Json(spec): Json<PlanSpec>,
) -> ApiResult<(StatusCode, Json<PlanRecord>)> {
    let record = state
        .plane
        .sites()
        .upsert_plan(spec)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Create a bench.
pub async fn create_bench(
    State(state): State<AppState>,
    Json(request): Json<BenchRequest>,
) -> ApiResult<(StatusCode, Json<BenchRecord>)> {
    info!(
        candidate = %request.candidate,
        server = %request.server,
        "creating bench via API"
    );
    let bench = state
        .plane
        .benches()
        .create_bench(request)
        .await
        .map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(bench)))
}

/// Get a bench.
pub async fn get_bench(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<BenchRecord>> {
    let bench = state
        .plane
        .benches()
        .bench(&BenchId::new(name))
        .await
        .map_err(reject)?;
    Ok(Json(bench))
}

/// Archive a bench.
pub async fn archive_bench(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<BenchRecord>)> {
    let bench = state
        .plane
        .benches()
        .archive_bench(&BenchId::new(name))
        .await
        .map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(bench)))
}

/// Create a site.
pub async fn create_site(
    State(state): State<AppState>,
    Json(request): Json<SiteRequest>,
) -> ApiResult<(StatusCode, Json<SiteRecord>)> {
    info!(
        subdomain = %request.subdomain,
        bench = %request.bench,
        "creating site via API"
    );
    let site = state
        .plane
        .sites()
        .create_site(request)
        .await
        .map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(site)))
}

/// List sites.
pub async fn list_sites(
    State(state): State<AppState>,
    Query(query): Query<ListSitesQuery>,
) -> ApiResult<Json<Vec<SiteRecord>>> {
    let mut filter = SiteFilter::new();
    if let Some(bench) = query.bench {
        filter = filter.with_bench(BenchId::new(bench));
    }
    if let Some(ref status) = query.status {
        let status: SiteStatus = status
            .parse()
            .map_err(|e: String| reject(ControlError::Validation(e)))?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }

    let sites = state.plane.sites().sites(&filter).await.map_err(reject)?;
    Ok(Json(sites))
}

/// Get a site.
pub async fn get_site(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteRecord>> {
    let site = state
        .plane
        .sites()
        .site(&SiteId::new(name))
        .await
        .map_err(reject)?;
    Ok(Json(site))
}

/// Start a site lifecycle action.
pub async fn transition_site(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<SiteRecord>)> {
    let action: SiteAction = action
        .parse()
        .map_err(|e: String| reject(ControlError::Validation(e)))?;
    let site = SiteId::new(name);
    info!(site = %site, %action, "site transition via API");

    let record = state
        .plane
        .sites()
        .transition(&site, action)
        .await
        .map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// Resolve a site's public hostname.
pub async fn primary_domain(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PrimaryDomainResponse>> {
    let site = SiteId::new(name);
    let domain = state
        .plane
        .domains()
        .primary_domain_name(&site)
        .await
        .map_err(reject)?;
    Ok(Json(PrimaryDomainResponse {
        site: site.to_string(),
        domain,
    }))
}

/// Bind a domain to a site.
pub async fn add_domain(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<AddDomainRequest>,
) -> ApiResult<(StatusCode, Json<SiteDomainRecord>)> {
    let record = state
        .plane
        .domains()
        .add_domain(&SiteId::new(name), &request.domain, request.primary)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// List a site's domains.
pub async fn list_domains(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<SiteDomainRecord>>> {
    let domains = state
        .plane
        .domains()
        .domains(&SiteId::new(name))
        .await
        .map_err(reject)?;
    Ok(Json(domains))
}

/// Flag or unflag a primary domain.
pub async fn set_primary(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SetPrimaryRequest>,
) -> ApiResult<Json<SiteDomainRecord>> {
    let record = state
        .plane
        .domains()
        .set_primary(&DomainId::new(name), request.primary)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

/// Unbind a domain.
pub async fn remove_domain(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .plane
        .domains()
        .remove_domain(&DomainId::new(name))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}
