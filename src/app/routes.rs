use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::app::orchestrator::{
    DiscoverySummary, EndpointReport, Orchestrator, Outcome, SiteDiscoveryReport, SweepSummary,
};
use crate::app::store::{SiteRegistration, register_site};
use crate::change::{ChangeStatistics, RecentChangeAnalysis};
use crate::model::{ContentChange, Endpoint, MonitoredSite};

pub const DEFAULT_STATS_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_ANALYSIS_WINDOW_DAYS: u32 = 7;
const MAX_STATS_WINDOW_DAYS: u32 = 3650;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/sites", get(list_sites).post(create_site))
        .route("/sites/:site_id/endpoints", get(list_site_endpoints))
        .route("/trigger/discovery", post(trigger_discovery))
        .route("/trigger/discovery/:site_id", post(trigger_site_discovery))
        .route("/trigger/content-sweep", post(trigger_content_sweep))
        .route(
            "/trigger/endpoints/:endpoint_id/fetch",
            post(trigger_endpoint_fetch),
        )
        .route("/status/sweep", get(sweep_status))
        .route("/status/changes", get(change_statistics))
        .route("/changes", get(list_unprocessed_changes))
        .route("/changes/:change_id/processed", post(mark_change_processed))
        .route(
            "/endpoints/:endpoint_id/changes/processed",
            post(mark_endpoint_changes_processed),
        )
        .route("/endpoints/:endpoint_id/analysis", get(recent_change_analysis))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn internal(context: &str, err: anyhow::Error) -> ApiError {
    tracing::error!(?err, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{context}: {err:#}"),
    )
}

fn not_found(what: &str, id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{what} not found: {id}"))
}

async fn list_sites(State(state): State<AppState>) -> ApiResult<Vec<MonitoredSite>> {
    let sites = state
        .orchestrator
        .store()
        .get_active_sites()
        .await
        .map_err(|err| internal("list sites", err))?;
    Ok(Json(sites))
}

#[derive(Debug, Deserialize)]
struct CreateSiteRequest {
    url: String,
    #[serde(default)]
    domain: Option<String>,
}

async fn create_site(
    State(state): State<AppState>,
    Json(req): Json<CreateSiteRequest>,
) -> Result<(StatusCode, Json<MonitoredSite>), ApiError> {
    let site = MonitoredSite::from_url(&req.url, req.domain.as_deref())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;

    let registration = register_site(state.orchestrator.store().as_ref(), site)
        .await
        .map_err(|err| internal("register site", err))?;
    let status = match registration {
        SiteRegistration::Created(_) => StatusCode::CREATED,
        SiteRegistration::Existing(_) => StatusCode::OK,
    };
    Ok((status, Json(registration.into_site())))
}

async fn list_site_endpoints(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Vec<Endpoint>> {
    let store = state.orchestrator.store();
    if store
        .get_site(&site_id)
        .await
        .map_err(|err| internal("load site", err))?
        .is_none()
    {
        return Err(not_found("site", &site_id));
    }
    let endpoints = store
        .get_endpoints_for_site(&site_id)
        .await
        .map_err(|err| internal("list endpoints", err))?;
    Ok(Json(endpoints))
}

async fn trigger_discovery(State(state): State<AppState>) -> ApiResult<Outcome<DiscoverySummary>> {
    let outcome = state
        .orchestrator
        .run_discovery_sweep()
        .await
        .map_err(|err| internal("discovery sweep", err))?;
    Ok(Json(outcome))
}

async fn trigger_site_discovery(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Outcome<SiteDiscoveryReport>> {
    state
        .orchestrator
        .trigger_site_discovery(&site_id)
        .await
        .map_err(|err| internal("site discovery", err))?
        .map(Json)
        .ok_or_else(|| not_found("site", &site_id))
}

async fn trigger_content_sweep(State(state): State<AppState>) -> ApiResult<Outcome<SweepSummary>> {
    let outcome = state
        .orchestrator
        .run_content_sweep()
        .await
        .map_err(|err| internal("content sweep", err))?;
    Ok(Json(outcome))
}

async fn trigger_endpoint_fetch(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
) -> ApiResult<Outcome<EndpointReport>> {
    state
        .orchestrator
        .trigger_endpoint_fetch(&endpoint_id)
        .await
        .map_err(|err| internal("endpoint fetch", err))?
        .map(Json)
        .ok_or_else(|| not_found("endpoint", &endpoint_id))
}

#[derive(Debug, Serialize)]
struct SweepStatus {
    content_sweep_running: bool,
    discovery_running: bool,
}

async fn sweep_status(State(state): State<AppState>) -> Json<SweepStatus> {
    Json(SweepStatus {
        content_sweep_running: state.orchestrator.is_content_sweep_running(),
        discovery_running: state.orchestrator.is_discovery_running(),
    })
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    days: Option<u32>,
}

impl WindowQuery {
    fn days_or(&self, default: u32) -> Result<u32, ApiError> {
        let days = self.days.unwrap_or(default);
        if days == 0 || days > MAX_STATS_WINDOW_DAYS {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("days must be between 1 and {MAX_STATS_WINDOW_DAYS}"),
            ));
        }
        Ok(days)
    }
}

async fn change_statistics(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<ChangeStatistics> {
    let days = q.days_or(DEFAULT_STATS_WINDOW_DAYS)?;
    let stats = state
        .orchestrator
        .detector()
        .change_statistics(days)
        .await
        .map_err(|err| internal("change statistics", err))?;
    Ok(Json(stats))
}

async fn list_unprocessed_changes(State(state): State<AppState>) -> ApiResult<Vec<ContentChange>> {
    let changes = state
        .orchestrator
        .store()
        .get_unprocessed_changes()
        .await
        .map_err(|err| internal("list changes", err))?;
    Ok(Json(changes))
}

#[derive(Debug, Serialize)]
struct ChangeAcknowledged {
    change_id: String,
    processed: bool,
}

async fn mark_change_processed(
    State(state): State<AppState>,
    Path(change_id): Path<String>,
) -> ApiResult<ChangeAcknowledged> {
    let marked = state
        .orchestrator
        .store()
        .mark_change_processed(&change_id)
        .await
        .map_err(|err| internal("mark change processed", err))?;
    if !marked {
        return Err(not_found("change", &change_id));
    }
    Ok(Json(ChangeAcknowledged {
        change_id,
        processed: true,
    }))
}

async fn require_endpoint(state: &AppState, endpoint_id: &str) -> Result<(), ApiError> {
    state
        .orchestrator
        .store()
        .get_endpoint(endpoint_id)
        .await
        .map_err(|err| internal("load endpoint", err))?
        .map(|_| ())
        .ok_or_else(|| not_found("endpoint", endpoint_id))
}

#[derive(Debug, Serialize)]
struct EndpointChangesAcknowledged {
    endpoint_id: String,
    marked: usize,
}

async fn mark_endpoint_changes_processed(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
) -> ApiResult<EndpointChangesAcknowledged> {
    require_endpoint(&state, &endpoint_id).await?;
    let marked = state
        .orchestrator
        .detector()
        .mark_changes_processed(&endpoint_id)
        .await
        .map_err(|err| internal("mark endpoint changes processed", err))?;
    Ok(Json(EndpointChangesAcknowledged {
        endpoint_id,
        marked,
    }))
}

async fn recent_change_analysis(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<RecentChangeAnalysis> {
    let days = q.days_or(DEFAULT_ANALYSIS_WINDOW_DAYS)?;
    require_endpoint(&state, &endpoint_id).await?;
    let analysis = state
        .orchestrator
        .detector()
        .analyze_recent_changes(&endpoint_id, days)
        .await
        .map_err(|err| internal("recent change analysis", err))?;
    Ok(Json(analysis))
}
