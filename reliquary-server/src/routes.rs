//! HTTP route handlers for the dashboard and automation API.
//!
//! Engine and query calls touch the disk, so every handler runs them on the
//! blocking pool.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use reliquary::core::projection::{RunFilter, Stats};
use reliquary::core::status::RunStatus;
use reliquary::core::types::{
    DecisionLogEntry, EvidenceEntry, EvidenceInput, NewRun, RunRecord, RunSummary,
};
use reliquary::error::EngineError;
use reliquary::query::VerifyReport;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::sse::events_handler;
use crate::state::AppState;

/// Build the application router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/evidence", get(get_evidence))
        .route("/runs/{id}/decision_log", get(get_decision_log))
        .route("/runs/{id}/decision_log/verify", get(verify_decision_log))
        .route("/runs/{id}/attempts", post(record_attempt))
        .route("/runs/{id}/request_info", post(request_info))
        .route("/runs/{id}/provide_info", post(provide_info))
        .route("/runs/{id}/request_approval", post(request_approval))
        .route("/runs/{id}/approve", post(approve))
        .route("/runs/{id}/fail", post(fail_run))
        .route("/runs/{id}/reconcile", post(reconcile))
        .route("/stats", get(get_stats))
        .route("/events", get(events_handler))
}

/// Run a synchronous engine or query call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

async fn health() -> &'static str {
    "ok"
}

/// Body of every successful mutation.
#[derive(Debug, Serialize)]
struct MutationResponse {
    status: &'static str,
    new_status: RunStatus,
}

async fn mutate<F>(state: AppState, f: F) -> Result<Json<MutationResponse>, ApiError>
where
    F: FnOnce(&AppState) -> Result<RunRecord, EngineError> + Send + 'static,
{
    let worker = state.clone();
    let record = blocking(move || f(&worker)).await?;
    state.notify(&record.work_item_id, record.status);
    Ok(Json(MutationResponse {
        status: "success",
        new_status: record.status,
    }))
}

/// Listing query. Empty values count as absent.
#[derive(Debug, Default, Deserialize)]
struct ListParams {
    repo: Option<String>,
    status: Option<String>,
    failure_mode: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_count(name: &str, value: Option<String>) -> Result<Option<usize>, ApiError> {
    non_empty(value)
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ApiError::BadRequest(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

impl ListParams {
    fn into_query(self) -> Result<(RunFilter, Option<usize>, usize), ApiError> {
        let status = non_empty(self.status)
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        let filter = RunFilter {
            repo: non_empty(self.repo),
            status,
            failure_mode: non_empty(self.failure_mode),
        };
        let limit = parse_count("limit", self.limit)?;
        let offset = parse_count("offset", self.offset)?.unwrap_or(0);
        Ok((filter, limit, offset))
    }
}

#[derive(Debug, Serialize)]
struct RunsResponse {
    runs: Vec<RunSummary>,
    count: usize,
}

/// GET /runs - filtered run summaries in dashboard order.
async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<RunsResponse>, ApiError> {
    let (filter, limit, offset) = params.into_query()?;
    let runs = blocking(move || state.query.list_runs(&filter, limit, offset)).await?;
    Ok(Json(RunsResponse {
        count: runs.len(),
        runs,
    }))
}

/// POST /runs - start tracking a work item.
async fn create_run(
    State(state): State<AppState>,
    Json(new_run): Json<NewRun>,
) -> Result<(StatusCode, Json<MutationResponse>), ApiError> {
    let response = mutate(state, move |s| s.engine.create_run(new_run)).await?;
    Ok((StatusCode::CREATED, response))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    Ok(Json(blocking(move || state.query.get_run(&id)).await?))
}

async fn get_evidence(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EvidenceEntry>>, ApiError> {
    Ok(Json(blocking(move || state.query.get_evidence(&id)).await?))
}

async fn get_decision_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DecisionLogEntry>>, ApiError> {
    Ok(Json(blocking(move || state.query.get_decision_log(&id)).await?))
}

async fn verify_decision_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VerifyReport>, ApiError> {
    Ok(Json(
        blocking(move || state.query.verify_decision_log(&id)).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct AttemptBody {
    success: bool,
    #[serde(default)]
    evidence: Vec<EvidenceInput>,
}

async fn record_attempt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttemptBody>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| {
        s.engine.record_attempt(&id, body.success, body.evidence)
    })
    .await
}

#[derive(Debug, Deserialize)]
struct QuestionBody {
    question: String,
}

async fn request_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QuestionBody>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| s.engine.request_info(&id, &body.question)).await
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    answer: String,
}

/// POST /runs/{id}/provide_info - answer the pending question.
async fn provide_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| s.engine.provide_info(&id, &body.answer)).await
}

async fn request_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| s.engine.request_approval(&id)).await
}

#[derive(Debug, Deserialize)]
struct ApprovalBody {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// POST /runs/{id}/approve - approve or reject a run waiting for approval.
async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApprovalBody>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| {
        s.engine
            .decide_approval(&id, body.approved, body.reason.as_deref())
    })
    .await
}

#[derive(Debug, Deserialize)]
struct FailBody {
    failure_mode: String,
}

async fn fail_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FailBody>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| s.engine.fail_run(&id, &body.failure_mode)).await
}

async fn reconcile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MutationResponse>, ApiError> {
    mutate(state, move |s| s.engine.reconcile(&id)).await
}

/// GET /stats - aggregate outcome statistics.
async fn get_stats(State(state): State<AppState>) -> Result<Json<Stats>, ApiError> {
    Ok(Json(blocking(move || state.query.get_stats()).await?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use reliquary::io::config::ReliquaryConfig;
    use reliquary::io::store::{MemoryRunStore, RunStore};
    use reliquary::project::Project;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::state::ChangeEvent;

    fn state() -> AppState {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        AppState::new(Project::from_store(store, ReliquaryConfig::default()))
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let response = router()
            .with_state(state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    async fn create(state: &AppState, id: &str) {
        let (status, body) = call(
            state,
            Method::POST,
            "/runs",
            Some(json!({
                "work_item_id": id,
                "repo_name": "api",
                "ticket_title": "Fix login",
                "task_raw": "fix the login bug",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body, json!({"status": "success", "new_status": "IN_PROGRESS"}));
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = call(&state(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".to_string()));
    }

    #[tokio::test]
    async fn info_round_trip_over_http() {
        let state = state();
        let mut events = state.event_tx.subscribe();
        create(&state, "W1").await;

        let (status, body) = call(
            &state,
            Method::POST,
            "/runs/W1/request_info",
            Some(json!({"question": "which tenant?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_status"], "NEEDS_INFO");

        let (status, body) = call(
            &state,
            Method::POST,
            "/runs/W1/provide_info",
            Some(json!({"answer": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_status"], "IN_PROGRESS");

        let (_, record) = call(&state, Method::GET, "/runs/W1", None).await;
        assert_eq!(record["pending_question"], Value::Null);
        let (_, log) = call(&state, Method::GET, "/runs/W1/decision_log", None).await;
        assert_eq!(log.as_array().map(Vec::len), Some(2));

        assert_eq!(
            events.try_recv().expect("created event"),
            ChangeEvent::RunChanged {
                work_item_id: "W1".to_string(),
                status: RunStatus::InProgress,
            }
        );
    }

    #[tokio::test]
    async fn invalid_transition_reports_current_status() {
        let state = state();
        create(&state, "W1").await;
        let (status, body) = call(
            &state,
            Method::POST,
            "/runs/W1/approve",
            Some(json!({"approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_transition");
        assert_eq!(body["current_status"], "IN_PROGRESS");
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/runs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "run_not_found");

        create(&state, "W1").await;
        let (status, _) = call(
            &state,
            Method::POST,
            "/runs",
            Some(json!({
                "work_item_id": "W1",
                "repo_name": "api",
                "ticket_title": "t",
                "task_raw": "x",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        call(&state, Method::POST, "/runs/W1/request_approval", None).await;
        let (status, body) = call(
            &state,
            Method::POST,
            "/runs/W1/approve",
            Some(json!({"approved": false, "reason": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");
    }

    #[tokio::test]
    async fn listing_and_stats() {
        let state = state();
        for id in ["A", "B", "C"] {
            create(&state, id).await;
        }
        call(
            &state,
            Method::POST,
            "/runs/A/attempts",
            Some(json!({
                "success": true,
                "evidence": [{"kind": "test_run", "payload_ref": "logs/a.txt", "exit_code": 0}],
            })),
        )
        .await;
        call(
            &state,
            Method::POST,
            "/runs/B/fail",
            Some(json!({"failure_mode": "repo_archived"})),
        )
        .await;

        let (status, body) = call(&state, Method::GET, "/runs?status=&repo=api&limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["runs"][0]["work_item_id"], "C");
        assert!(body["runs"][0].get("failure_mode").is_none());

        let (_, body) = call(&state, Method::GET, "/runs?status=blocked", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["runs"][0]["failure_mode"], "repo_archived");

        let (status, _) = call(&state, Method::GET, "/runs?status=DONE", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, evidence) = call(&state, Method::GET, "/runs/A/evidence", None).await;
        assert_eq!(evidence[0]["exit_code"], 0);

        let (_, stats) = call(&state, Method::GET, "/stats", None).await;
        assert_eq!(stats["total_runs"], 3);
        assert_eq!(stats["successful_runs"], 1);
        assert_eq!(stats["failure_modes"]["repo_archived"], 1);

        let (_, report) = call(&state, Method::GET, "/runs/A/decision_log/verify", None).await;
        assert_eq!(report["valid"], true);
    }

    #[tokio::test]
    async fn file_backed_state_survives_restart() {
        use reliquary::io::init::{InitOptions, init_reliquary};
        use reliquary::project::open_store;

        let temp = tempfile::tempdir().expect("tempdir");
        init_reliquary(temp.path(), &InitOptions { force: false }).expect("init");
        let open = || {
            let (store, config) = open_store(temp.path()).expect("open");
            let store: Arc<dyn RunStore> = Arc::new(store);
            AppState::new(Project::from_store(store, config))
        };

        let first = open();
        create(&first, "W9").await;
        call(&first, Method::POST, "/runs/W9/request_approval", None).await;
        drop(first);

        let second = open();
        let (status, record) = call(&second, Method::GET, "/runs/W9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "PENDING_APPROVAL");
        let (_, report) = call(&second, Method::GET, "/runs/W9/decision_log/verify", None).await;
        assert_eq!(report["valid"], true);
        assert_eq!(report["entries"], 1);
    }
}
