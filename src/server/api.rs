use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use trilha_common::{
    Actor, AttendanceStatus, AvailabilityWindow, Case, NewCase, NewSession, PatientInfo,
    SessionNotesPatch, StageKey,
};

use crate::errors::{PipelineError, ValidationError};
use crate::pipeline::Services;
use crate::pipeline::board::BoardView;
use crate::pipeline::collaborators::ExportSection;
use crate::pipeline::pendency::compute_pendencies;
use crate::pipeline::stages::{StageInput, StageView};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub services: Services,
    pub views: Vec<BoardView>,
}

impl AppState {
    pub fn view(&self, name: &str) -> Option<&BoardView> {
        Services::find_view(&self.views, name)
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCaseRequest {
    pub patient: PatientInfo,
    #[serde(default)]
    pub availability: BTreeSet<AvailabilityWindow>,
    #[serde(default)]
    pub contribution_amount: Option<f64>,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub target: StageKey,
    pub input: StageInput,
}

#[derive(Deserialize)]
pub struct MoveCaseRequest {
    pub target: StageKey,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct AttachFileRequest {
    pub name: String,
    pub url: String,
}

#[derive(Deserialize)]
pub struct CommunicationRequest {
    pub template_id: String,
}

#[derive(Deserialize)]
pub struct AddSessionRequest {
    pub scheduled_at: NaiveDateTime,
    #[serde(default)]
    pub assignment_id: Option<String>,
}

#[derive(Deserialize)]
pub struct AttendanceRequest {
    pub status: AttendanceStatus,
}

#[derive(Deserialize)]
pub struct ExportQuery {
    /// Comma-separated section names; all sections when absent.
    pub sections: Option<String>,
}

#[derive(Serialize)]
pub struct CaseDetail {
    pub case: Case,
    pub view: StageView,
}

#[derive(Serialize)]
pub struct CommunicationResponse {
    pub message: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(ValidationError),
    Conflict(String),
    Unavailable(String),
    Internal { message: String, changed: bool },
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let changed = err.changed_state();
        match err {
            PipelineError::CaseNotFound { .. } | PipelineError::SessionNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            PipelineError::Validation(validation) => ApiError::Unprocessable(validation),
            PipelineError::SaveUnavailable { .. } => ApiError::Conflict(err.to_string()),
            PipelineError::StoreUnavailable(_) => ApiError::Unavailable(err.to_string()),
            PipelineError::RegistryMismatch { .. } | PipelineError::SideEffectFailed { .. } => {
                ApiError::Internal {
                    message: err.to_string(),
                    changed,
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": msg, "changed": false}),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": msg, "changed": false}),
            ),
            ApiError::Unprocessable(v) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({"error": v.message, "field": v.field, "changed": false}),
            ),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                serde_json::json!({"error": msg, "changed": false}),
            ),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({"error": msg, "changed": false}),
            ),
            ApiError::Internal { message, changed } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": message, "changed": changed}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ── Actor identity ────────────────────────────────────────────────────

/// The caller, from `x-actor-id` and `x-actor-name`.
pub struct RequestActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for RequestActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_value = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        let id = header_value("x-actor-id")
            .ok_or_else(|| ApiError::BadRequest("Missing x-actor-id header".into()))?;
        let name = header_value("x-actor-name").unwrap_or_else(|| id.clone());
        Ok(RequestActor(Actor::new(id, name)))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/views", get(list_views))
        .route("/api/views/{name}/board", get(get_board))
        .route("/api/cases", post(create_case))
        .route("/api/cases/{id}", get(get_case))
        .route("/api/cases/{id}/transition", post(transition_case))
        .route("/api/cases/{id}/move", post(move_case))
        .route("/api/cases/{id}/files", post(attach_file))
        .route("/api/cases/{id}/communications", post(record_communication))
        .route("/api/cases/{id}/history", get(get_history))
        .route("/api/cases/{id}/pendencies", get(get_pendencies))
        .route("/api/cases/{id}/export", get(export_case))
        .route("/api/cases/{id}/sessions", get(list_sessions).post(add_session))
        .route("/api/sessions/{id}/attendance", patch(set_attendance))
        .route("/api/sessions/{id}/notes", patch(set_notes))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_views(State(state): State<SharedState>) -> Json<Vec<BoardView>> {
    Json(state.views.clone())
}

async fn get_board(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .view(&name)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Board view '{}' not found", name)))?;
    let mut board = state.services.board();
    let snapshot = board.open(view).await?;
    board.close();
    Ok(Json(snapshot))
}

async fn create_case(
    State(state): State<SharedState>,
    RequestActor(actor): RequestActor,
    Json(req): Json<CreateCaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new_case = NewCase {
        patient: req.patient,
        availability: req.availability,
        contribution_amount: req.contribution_amount,
    };
    let case = state.services.coordinator().open_case(new_case, &actor).await?;
    Ok((StatusCode::CREATED, Json(case)))
}

async fn get_case(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let case = state.services.store.get(&id).await?;
    let view = state.services.registry.render(&case)?;
    Ok(Json(CaseDetail { case, view }))
}

async fn transition_case(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .services
        .coordinator()
        .transition(&id, req.target, req.input, &actor)
        .await?;
    Ok(Json(outcome))
}

async fn move_case(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<MoveCaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let case = state
        .services
        .coordinator()
        .move_manually(&id, req.target, &req.reason, &actor)
        .await?;
    Ok(Json(case))
}

async fn attach_file(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<AttachFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let case = state
        .services
        .coordinator()
        .attach_file(&id, &req.name, &req.url, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(case)))
}

async fn record_communication(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<CommunicationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .services
        .coordinator()
        .record_final_communication(&id, &req.template_id, &actor)
        .await?;
    Ok(Json(CommunicationResponse { message }))
}

async fn get_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.services.store.get(&id).await?;
    let entries = state.services.history.list(&id).await?;
    Ok(Json(entries))
}

async fn get_pendencies(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let s = &state.services;
    let case = s.store.get(&id).await?;
    let sessions = s.ledger.list_by_case(&id).await?;
    let pendencies = compute_pendencies(&case, &sessions, s.clock.local_now(), &s.settings.pendency);
    Ok(Json(pendencies))
}

async fn export_case(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sections: Vec<ExportSection> = match query.sections.as_deref() {
        None => ExportSection::ALL.to_vec(),
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<ExportSection>())
            .collect::<Result<_, _>>()
            .map_err(ApiError::BadRequest)?,
    };
    let s = &state.services;
    let case = s.store.get(&id).await?;
    let sessions = s.ledger.list_by_case(&id).await?;
    let bytes = s
        .exporter
        .export(&case, &sessions, &sections)
        .map_err(|e| ApiError::Internal {
            message: format!("Export failed: {}", e),
            changed: false,
        })?;
    Ok(([(header::CONTENT_TYPE, s.exporter.content_type())], bytes))
}

async fn list_sessions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.services.store.get(&id).await?;
    let sessions = state.services.ledger.list_by_case(&id).await?;
    Ok(Json(sessions))
}

async fn add_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<AddSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let case = state.services.store.get(&id).await?;
    if let Some(assignment_id) = &req.assignment_id
        && case.assignment(assignment_id).is_none()
    {
        return Err(ApiError::Unprocessable(ValidationError::field(
            "assignment_id",
            format!("Assignment {} is not on this case", assignment_id),
        )));
    }
    let session = state
        .services
        .ledger
        .add(
            NewSession {
                case_id: case.id,
                assignment_id: req.assignment_id,
                scheduled_at: req.scheduled_at,
            },
            &actor,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn set_attendance(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(req): Json<AttendanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .ledger
        .set_attendance(&id, req.status, &actor)
        .await?;
    Ok(Json(session))
}

async fn set_notes(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    RequestActor(actor): RequestActor,
    Json(notes): Json<SessionNotesPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.services.ledger.set_notes(&id, notes, &actor).await?;
    Ok(Json(session))
}
