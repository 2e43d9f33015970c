pub mod config;
pub mod enrich;
pub mod error;
pub mod fetcher;
pub mod github;
pub mod metrics;
pub mod querier;
pub mod release;
pub mod render;
pub mod sprint;
pub mod window;
pub mod workflows;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use config::{AppConfig, EnrichmentPolicy, RepoId};
use error::MetricsError;
use github::{Commit, Repository, RepositorySource};
use querier::{
    CommitListQuery, ListQuery, MetricsQuerier, MetricsQuery, PullRequestFilter,
    PullRequestListing, ReleaseQuery, RepositoriesQuery, SprintQuery, WorkflowRunsQuery,
};
use release::{ReleaseReports, TagFilter};
use serde::{Deserialize, Serialize};
use sprint::{SprintReport, SprintWindow};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use window::DateWindow;
use workflows::WorkflowBilling;

type ApiError = (StatusCode, String);

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    /// Service for querying pull request metrics.
    pub querier: MetricsQuerier,
    /// Application configuration loaded from environment variables.
    pub config: AppConfig,
}

impl AppState {
    /// Initializes the application state with a GitHub-backed querier.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let querier = MetricsQuerier::new(&config)?;
        Ok(Self { querier, config })
    }

    pub fn with_source(config: AppConfig, source: Arc<dyn RepositorySource>) -> Self {
        let querier = MetricsQuerier::with_source(&config, source);
        Self { querier, config }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/defaults", get(get_defaults))
        .route("/api/repos/{owner}/{repo}/pulls", get(get_pull_requests))
        .route("/api/repos/{owner}/{repo}/metrics", get(get_pull_request_metrics))
        .route("/api/repos/{owner}/{repo}/sprints", post(post_sprint_metrics))
        .route("/api/repos/{owner}/{repo}/releases/report", get(get_release_report))
        .route("/api/repos/{owner}/{repo}/commits/compare", get(get_commit_list))
        .route("/api/repos/{owner}/{repo}/workflows/billing", get(get_workflow_billing))
        .route("/api/repos/{owner}/{repo}/workflows/runs/billing", get(get_workflow_run_billing))
        .route("/api/user/repos", get(get_user_repositories))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "prflow",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Effective settings, without credentials.
pub async fn get_defaults(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json(state.config.clone())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub base: Option<String>,
    pub state: Option<String>,
    pub page_size: Option<u8>,
    pub page: Option<u32>,
}

pub async fn get_pull_requests(
    Path(repo_id): Path<RepoId>,
    Query(params): Query<ListParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PullRequestListing>>, ApiError> {
    let query = ListQuery {
        repo: repo_id.clone(),
        filter: PullRequestFilter {
            base: params.base,
            state: params.state,
            page_size: params.page_size,
        },
        page: params.page.unwrap_or(1),
    };

    let listing = state
        .querier
        .pull_requests(&query)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(listing))
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub base: Option<String>,
    pub state: Option<String>,
    pub page_size: Option<u8>,
    pub policy: Option<EnrichmentPolicy>,
}

pub async fn get_pull_request_metrics(
    Path(repo_id): Path<RepoId>,
    Query(params): Query<MetricsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<metrics::PullRequestMetrics>, ApiError> {
    let window = DateWindow::parse(params.start_date.as_deref(), params.end_date.as_deref())
        .map_err(|e| error_response(&repo_id, e))?;
    let query = MetricsQuery {
        repo: repo_id.clone(),
        window,
        filter: PullRequestFilter {
            base: params.base,
            state: params.state,
            page_size: params.page_size,
        },
        policy: params.policy,
    };

    match state.querier.pull_request_metrics(&query).await {
        Ok(metrics) => {
            tracing::debug!(repo_id = %repo_id, count = metrics.count, "Returning metrics");
            Ok(Json(metrics))
        }
        Err(e) => Err(error_response(&repo_id, e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct SprintRequest {
    pub sprints: Vec<SprintWindow>,
    #[serde(default)]
    pub tag_filter: TagFilter,
    pub base: Option<String>,
    pub state: Option<String>,
    pub page_size: Option<u8>,
    pub policy: Option<EnrichmentPolicy>,
}

pub async fn post_sprint_metrics(
    Path(repo_id): Path<RepoId>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<SprintRequest>,
) -> Result<Json<Vec<SprintReport>>, ApiError> {
    let query = SprintQuery {
        repo: repo_id.clone(),
        sprints: request.sprints,
        filter: PullRequestFilter {
            base: request.base,
            state: request.state,
            page_size: request.page_size,
        },
        tag_filter: request.tag_filter,
        policy: request.policy,
    };

    let reports = state
        .querier
        .sprint_metrics(&query)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(reports))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub version_pattern: bool,
    pub service_initials: Option<usize>,
}

pub async fn get_release_report(
    Path(repo_id): Path<RepoId>,
    Query(params): Query<ReleaseParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReleaseReports>, ApiError> {
    let window = DateWindow::parse(params.start_date.as_deref(), params.end_date.as_deref())
        .map_err(|e| error_response(&repo_id, e))?;
    let query = ReleaseQuery {
        repo: repo_id.clone(),
        window,
        tag_filter: TagFilter::from_flags(params.version_pattern, params.service_initials),
    };

    let report = state
        .querier
        .release_report(&query)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct CompareParams {
    #[serde(default)]
    pub base: String,
    pub head: Option<String>,
}

pub async fn get_commit_list(
    Path(repo_id): Path<RepoId>,
    Query(params): Query<CompareParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Commit>>, ApiError> {
    let query = CommitListQuery {
        repo: repo_id.clone(),
        base: params.base,
        head: params.head,
    };

    let commits = state
        .querier
        .commit_list(&query)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(commits))
}

pub async fn get_workflow_billing(
    Path(repo_id): Path<RepoId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkflowBilling>>, ApiError> {
    let billing = state
        .querier
        .workflow_billing(&repo_id)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(billing))
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowRunsParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page_size: Option<u8>,
}

pub async fn get_workflow_run_billing(
    Path(repo_id): Path<RepoId>,
    Query(params): Query<WorkflowRunsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkflowBilling>>, ApiError> {
    let window = DateWindow::parse(params.start_date.as_deref(), params.end_date.as_deref())
        .map_err(|e| error_response(&repo_id, e))?;
    let query = WorkflowRunsQuery {
        repo: repo_id.clone(),
        window,
        page_size: params.page_size,
    };

    let billing = state
        .querier
        .workflow_run_billing(&query)
        .await
        .map_err(|e| error_response(&repo_id, e))?;
    Ok(Json(billing))
}

#[derive(Debug, Default, Deserialize)]
pub struct RepositoriesParams {
    pub page_size: Option<u8>,
    pub page: Option<u32>,
}

pub async fn get_user_repositories(
    Query(params): Query<RepositoriesParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Repository>>, ApiError> {
    let query = RepositoriesQuery {
        page_size: params.page_size,
        page: params.page.unwrap_or(1),
    };

    match state.querier.user_repositories(&query).await {
        Ok(repositories) => Ok(Json(repositories)),
        Err(e) => Err(error_response("user", e)),
    }
}

fn error_response(subject: impl std::fmt::Display, e: MetricsError) -> ApiError {
    if e.is_invalid_input() {
        tracing::debug!(subject = %subject, error = %e, "Rejected request");
        return (StatusCode::BAD_REQUEST, e.to_string());
    }

    tracing::error!(subject = %subject, error = %e, "Failed to build report");

    if let MetricsError::GitHub(octocrab::Error::GitHub { source, .. }) = e.root() {
        let message = source.message.to_lowercase();
        if message.contains("rate limit") {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                "GitHub Rate Limit Exceeded".to_string(),
            );
        }
        if message.contains("not found") {
            return (StatusCode::NOT_FOUND, "Not Found".to_string());
        }
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error".to_string(),
    )
}
