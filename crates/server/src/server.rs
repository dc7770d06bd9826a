//! HTTP boundary
//!
//! Three surfaces share one router: ingestion (test runners reporting
//! outcomes), review (humans resolving ambiguous healings), and reporting
//! (run summaries and fragility). Ingestion routes authenticate with the
//! project's API key; review and reporting are local-operator surfaces.

use crate::config::ServerConfig;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use selfheal_common::{
    BlobStore, Database, Error, EventSummary, HealingEvent, Project, RunTrigger, Screenshot,
    TestOutcome, TestRun,
};
use selfheal_engine::fragility::{self, TestFragility};
use selfheal_engine::orchestrator::{Orchestrator, ReportRequest, ReviewAction};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

const API_KEY_HEADER: &str = "x-selfheal-api-key";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    max_body_bytes: usize,
}

impl AppState {
    pub fn new(db: Database, blobs: BlobStore, cfg: &ServerConfig) -> Self {
        Self {
            orchestrator: Arc::new(Orchestrator::new(db, blobs)),
            max_body_bytes: cfg.limits.max_body_bytes,
        }
    }

    fn db(&self) -> &Database {
        self.orchestrator.db()
    }

    /// Ingestion auth: the caller must present the project's API key.
    fn authorize(&self, project_id: &str, headers: &HeaderMap) -> Result<Project, ApiError> {
        let project = self
            .db()
            .get_project(project_id)?
            .ok_or_else(|| Error::NotFound {
                kind: "project".to_string(),
                id: project_id.to_string(),
            })?;
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != project.api_key {
            return Err(ApiError::unauthorized());
        }
        Ok(project)
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Wire-level error: carries the status code and a JSON body with a
/// retryable hint so CI runners know whether to back off and retry.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retryable: bool,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "invalid or missing API key".to_string(),
            retryable: false,
        }
    }

    #[cfg(test)]
    fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. }
            | Error::RunNotActive { .. }
            | Error::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_)
            | Error::UnsupportedSelectorSyntax(_)
            | Error::NoCandidatesFound(_) => StatusCode::BAD_REQUEST,
            Error::SnapshotTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Database(_) | Error::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub id: String,
    pub name: String,
    /// Returned exactly once, at creation
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginRunRequest {
    pub project_id: String,
    pub branch: String,
    #[serde(default)]
    pub trigger: RunTrigger,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

/// One test outcome from a runner. Either names an existing run via
/// `testRunId` or supplies `projectId` (plus optional branch and commit)
/// to open one implicitly on first report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportWire {
    #[serde(default)]
    pub test_run_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    pub test_name: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub test_file: Option<String>,
    #[serde(default)]
    pub failed_selector: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub dom_snapshot: Option<String>,
}

/// Ack for a report. `healedSelector` is the runner-facing payload: when
/// present, the runner retries the step with it in the same session.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub test_run_id: String,
    pub test_name: String,
    pub status: Option<selfheal_common::HealingStatus>,
    pub healed_selector: Option<String>,
    pub confidence: Option<f64>,
    pub event_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub run: TestRun,
    pub summary: EventSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveWire {
    pub action: ResolveActionWire,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub candidate_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveActionWire {
    Heal,
    Ignore,
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotQuery {
    pub name: String,
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: selfheal_common::VERSION,
    })
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<CreateProjectResponse>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(Error::InvalidConfig("project name must not be empty".to_string()).into());
    }
    let api_key = format!("shk_{}", uuid::Uuid::new_v4().simple());
    let project = Project::new(req.name, api_key);
    state.db().insert_project(&project)?;
    info!("Created project {} ({})", project.name, project.id);
    Ok(Json(CreateProjectResponse {
        id: project.id,
        name: project.name,
        api_key: project.api_key,
    }))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    let mut projects = state.db().list_projects()?;
    // Keys never leave the server after creation
    for p in &mut projects {
        p.api_key = String::new();
    }
    Ok(Json(projects))
}

async fn begin_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BeginRunRequest>,
) -> Result<Json<TestRun>, ApiError> {
    state.authorize(&req.project_id, &headers)?;
    let run = state
        .orchestrator
        .begin_run(&req.project_id, req.branch, req.trigger, req.commit_sha)?;
    Ok(Json(run))
}

async fn report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(wire): Json<ReportWire>,
) -> Result<Json<ReportResponse>, ApiError> {
    let run = match &wire.test_run_id {
        Some(id) => {
            let run = state.db().get_run(id)?.ok_or_else(|| Error::NotFound {
                kind: "test_run".to_string(),
                id: id.clone(),
            })?;
            state.authorize(&run.project_id, &headers)?;
            run
        }
        None => {
            let project_id = wire.project_id.as_deref().ok_or_else(|| {
                Error::InvalidConfig(
                    "report requires a testRunId or a projectId".to_string(),
                )
            })?;
            state.authorize(project_id, &headers)?;
            state.orchestrator.begin_run(
                project_id,
                wire.branch.clone().unwrap_or_else(|| "main".to_string()),
                RunTrigger::Ci,
                wire.commit_sha.clone(),
            )?
        }
    };

    let req = ReportRequest {
        test_name: wire.test_name.clone(),
        test_file: wire.test_file,
        failed_selector: wire.failed_selector,
        error_message: wire.error_message,
        dom_snapshot: wire.dom_snapshot,
    };
    let ack = state
        .orchestrator
        .report_result(&run.id, wire.outcome, req)
        .await?;

    Ok(Json(ReportResponse {
        test_run_id: ack.run.id,
        test_name: wire.test_name,
        status: ack.event.as_ref().map(|e| e.status),
        healed_selector: ack.event.as_ref().and_then(|e| e.healed_selector.clone()),
        confidence: ack.event.as_ref().map(|e| e.confidence),
        event_id: ack.event.map(|e| e.id),
    }))
}

async fn complete_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<TestRun>, ApiError> {
    let run = state.db().get_run(&run_id)?.ok_or_else(|| Error::NotFound {
        kind: "test_run".to_string(),
        id: run_id.clone(),
    })?;
    state.authorize(&run.project_id, &headers)?;
    Ok(Json(state.orchestrator.complete_run(&run_id)?))
}

async fn fail_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<TestRun>, ApiError> {
    let run = state.db().get_run(&run_id)?.ok_or_else(|| Error::NotFound {
        kind: "test_run".to_string(),
        id: run_id.clone(),
    })?;
    state.authorize(&run.project_id, &headers)?;
    Ok(Json(state.orchestrator.fail_run(&run_id)?))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state.db().get_run(&run_id)?.ok_or_else(|| Error::NotFound {
        kind: "test_run".to_string(),
        id: run_id.clone(),
    })?;
    let events = state.db().list_events(&run_id)?;
    Ok(Json(RunDetail {
        run,
        summary: EventSummary::tally(&events),
    }))
}

async fn list_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<HealingEvent>>, ApiError> {
    state.db().get_run(&run_id)?.ok_or_else(|| Error::NotFound {
        kind: "test_run".to_string(),
        id: run_id.clone(),
    })?;
    Ok(Json(state.db().list_events(&run_id)?))
}

async fn attach_screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<ScreenshotQuery>,
    body: Bytes,
) -> Result<Json<Screenshot>, ApiError> {
    let run = state.db().get_run(&run_id)?.ok_or_else(|| Error::NotFound {
        kind: "test_run".to_string(),
        id: run_id.clone(),
    })?;
    state.authorize(&run.project_id, &headers)?;
    let shot = state
        .orchestrator
        .attach_screenshot(&run_id, query.name, &body)
        .await?;
    Ok(Json(shot))
}

async fn resolve_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(wire): Json<ResolveWire>,
) -> Result<Json<HealingEvent>, ApiError> {
    let action = match wire.action {
        ResolveActionWire::Heal => ReviewAction::Heal {
            selector: wire.selector,
            candidate_index: wire.candidate_index,
        },
        ResolveActionWire::Ignore => ReviewAction::Ignore,
    };
    Ok(Json(state.orchestrator.resolve_review(&event_id, action)?))
}

async fn project_fragility(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<TestFragility>>, ApiError> {
    state
        .db()
        .get_project(&project_id)?
        .ok_or_else(|| Error::NotFound {
            kind: "project".to_string(),
            id: project_id.clone(),
        })?;
    Ok(Json(fragility::analyze(state.db(), &project_id)?))
}

// ============================================================================
// Router and entrypoint
// ============================================================================

pub fn router(state: AppState) -> Router {
    let max_body = state.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/projects", post(create_project).get(list_projects))
        .route("/api/v1/projects/:id/fragility", get(project_fragility))
        .route("/api/v1/runs", post(begin_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/complete", post(complete_run))
        .route("/api/v1/runs/:id/fail", post(fail_run))
        .route("/api/v1/runs/:id/events", get(list_run_events))
        .route("/api/v1/runs/:id/screenshots", post(attach_screenshot))
        .route("/api/v1/events/:id/resolve", post(resolve_event))
        .route("/api/v1/reports", post(report))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    info!("SelfHeal server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfheal_common::HealingStatus;

    const PAGE: &str = r#"<html><body>
        <button id="btn-save-new" data-testid="save-btn">Save</button>
    </body></html>"#;

    async fn setup() -> (AppState, CreateProjectResponse, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().unwrap();
        let blobs = BlobStore::new(dir.path()).await.unwrap();
        let state = AppState::new(db, blobs, &ServerConfig::default());

        let created = create_project(
            State(state.clone()),
            Json(CreateProjectRequest {
                name: "webshop".into(),
            }),
        )
        .await
        .unwrap()
        .0;
        (state, created, dir)
    }

    fn keyed(api_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key.parse().unwrap());
        headers
    }

    fn wire(run_id: &str, test: &str, outcome: TestOutcome) -> ReportWire {
        ReportWire {
            test_run_id: Some(run_id.to_string()),
            project_id: None,
            test_name: test.to_string(),
            outcome,
            branch: None,
            commit_sha: None,
            test_file: None,
            failed_selector: None,
            error_message: None,
            dom_snapshot: None,
        }
    }

    async fn start_run(state: &AppState, project: &CreateProjectResponse) -> TestRun {
        begin_run(
            State(state.clone()),
            keyed(&project.api_key),
            Json(BeginRunRequest {
                project_id: project.id.clone(),
                branch: "main".into(),
                trigger: RunTrigger::Ci,
                commit_sha: None,
            }),
        )
        .await
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn healthz_reports_version() {
        let h = healthz().await.0;
        assert_eq!(h.status, "ok");
        assert_eq!(h.version, selfheal_common::VERSION);
    }

    #[tokio::test]
    async fn report_acks_healed_selector() {
        let (state, project, _dir) = setup().await;
        let run = start_run(&state, &project).await;

        let resp = report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(ReportWire {
                test_file: Some("save.spec.ts".into()),
                failed_selector: Some("#save-btn".into()),
                error_message: Some("locator resolved to 0 elements".into()),
                dom_snapshot: Some(PAGE.into()),
                ..wire(&run.id, "Save works", TestOutcome::Failed)
            }),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(resp.status, Some(HealingStatus::HealedAuto));
        assert_eq!(resp.healed_selector.as_deref(), Some("[data-testid=save-btn]"));
        assert!(resp.confidence.unwrap() >= 0.85);
        assert!(resp.event_id.is_some());
    }

    #[tokio::test]
    async fn passed_report_carries_no_event() {
        let (state, project, _dir) = setup().await;
        let run = start_run(&state, &project).await;

        let resp = report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(wire(&run.id, "Smoke", TestOutcome::Passed)),
        )
        .await
        .unwrap()
        .0;

        assert!(resp.status.is_none());
        assert!(resp.event_id.is_none());
    }

    #[tokio::test]
    async fn wrong_api_key_is_rejected() {
        let (state, project, _dir) = setup().await;

        let err = begin_run(
            State(state.clone()),
            keyed("shk_wrong"),
            Json(BeginRunRequest {
                project_id: project.id.clone(),
                branch: "main".into(),
                trigger: RunTrigger::Ci,
                commit_sha: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn run_detail_summarizes_events() {
        let (state, project, _dir) = setup().await;
        let run = start_run(&state, &project).await;

        report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(ReportWire {
                failed_selector: Some("#save-btn".into()),
                dom_snapshot: Some(PAGE.into()),
                ..wire(&run.id, "Save works", TestOutcome::Failed)
            }),
        )
        .await
        .unwrap();
        complete_run(
            State(state.clone()),
            keyed(&project.api_key),
            Path(run.id.clone()),
        )
        .await
        .unwrap();

        let detail = get_run(State(state.clone()), Path(run.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(detail.summary.auto_healed, 1);
        assert_eq!(detail.run.counters.healed, 1);

        let events = list_run_events(State(state.clone()), Path(run.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn resolve_heals_reviewed_event() {
        let (state, project, _dir) = setup().await;
        let run = start_run(&state, &project).await;

        // Partial class overlap: lands in review
        let page = r#"<html><body><div class="panel">x</div></body></html>"#;
        let resp = report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(ReportWire {
                failed_selector: Some(".panel.wide".into()),
                dom_snapshot: Some(page.into()),
                ..wire(&run.id, "Panel shows", TestOutcome::Failed)
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(resp.status, Some(HealingStatus::NeedsReview));

        let resolved = resolve_event(
            State(state.clone()),
            Path(resp.event_id.unwrap()),
            Json(ResolveWire {
                action: ResolveActionWire::Heal,
                selector: None,
                candidate_index: Some(0),
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(resolved.status, HealingStatus::HealedManual);
        assert!(resolved.healed_selector.is_some());
    }

    #[tokio::test]
    async fn listing_projects_withholds_keys() {
        let (state, _project, _dir) = setup().await;
        let projects = list_projects(State(state)).await.unwrap().0;
        assert_eq!(projects.len(), 1);
        assert!(projects[0].api_key.is_empty());
    }

    #[tokio::test]
    async fn unknown_run_maps_to_not_found() {
        let (state, project, _dir) = setup().await;
        let err = report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(wire("missing", "t", TestOutcome::Passed)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_without_run_opens_one() {
        let (state, project, _dir) = setup().await;

        let resp = report(
            State(state.clone()),
            keyed(&project.api_key),
            Json(ReportWire {
                test_run_id: None,
                project_id: Some(project.id.clone()),
                branch: Some("feature/save".into()),
                ..wire("", "Smoke", TestOutcome::Passed)
            }),
        )
        .await
        .unwrap()
        .0;

        let run = state.db().get_run(&resp.test_run_id).unwrap().unwrap();
        assert_eq!(run.branch, "feature/save");
        assert_eq!(run.counters.passed, 1);
    }

    #[tokio::test]
    async fn screenshots_round_trip() {
        let (state, project, _dir) = setup().await;
        let run = start_run(&state, &project).await;

        let shot = attach_screenshot(
            State(state.clone()),
            keyed(&project.api_key),
            Path(run.id.clone()),
            Query(ScreenshotQuery {
                name: "failure.png".into(),
            }),
            Bytes::from_static(b"\x89PNG..."),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(shot.name, "failure.png");
        assert!(!shot.blob_digest.is_empty());
    }

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).status()
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_of(Error::NotFound {
                kind: "project".into(),
                id: "x".into(),
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::RunNotActive {
                id: "r".into(),
                status: "completed".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::InvalidStateTransition {
                from: "healed_auto".into(),
                to: "ignored".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::UnsupportedSelectorSyntax("//x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::SnapshotTooLarge {
                size: 5_000_000,
                limit: 2_097_152,
            }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_of(Error::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
