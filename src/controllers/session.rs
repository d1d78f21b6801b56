use crate::error::{AppError, Result};
use crate::models::api::{
    AckResponse, CreateSessionRequest, CreateSessionResponse, JoinSessionRequest,
    JoinSessionResponse, SessionResponse, StudentSummary, StudentSummaryResponse,
    SummariesResponse, UpdateSessionRequest,
};
use crate::models::events::ServerEvent;
use crate::models::session::{Session, Student};
use crate::services::engine::SessionEngine;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;

/// Create a new session. The code is allocated by the store and handed
/// back to the slide-editor extension.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>)> {
    if req.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }

    let code = state.store.allocate_code().await?;
    let session = Session::new(
        code.clone(),
        req.title,
        req.description,
        req.language,
        req.initial_code,
        req.slides,
    );
    state.store.create(session).await?;

    info!(session_code = %code, "session created");
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            success: true,
            session_code: code,
        }),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<SessionResponse>> {
    let session = state.store.get(&code).await?;
    Ok(Json(SessionResponse { success: true, session }))
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<SessionResponse>> {
    let session = state
        .store
        .update(&code, move |doc| {
            if let Some(title) = req.title {
                doc.title = title;
            }
            if let Some(description) = req.description {
                doc.description = description;
            }
            if let Some(language) = req.language {
                doc.language = language;
            }
            if let Some(initial_code) = req.initial_code {
                doc.initial_code = initial_code;
            }
            doc.updated_at = Utc::now();
            doc.clone()
        })
        .await?;
    Ok(Json(SessionResponse { success: true, session }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<AckResponse>> {
    SessionEngine::delete_session(&state, &code).await?;
    Ok(Json(AckResponse { success: true }))
}

/// HTTP join: same mutation as the realtime `join-session`, minus the
/// socket attach. The caller takes the token to a later reconnect.
pub async fn join_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Json<JoinSessionResponse>> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    let existing = state.store.get(&code).await?;
    if !existing.active {
        return Err(AppError::Forbidden("session is no longer active".to_string()));
    }

    let mut student = Student::new(uuid::Uuid::new_v4());
    student.socket_endpoint_id = None;
    let token = student.reconnect_token.clone();
    let session = state
        .store
        .update(&code, move |doc| {
            doc.students.insert(req.name, student);
            doc.clone()
        })
        .await?;

    Ok(Json(JoinSessionResponse {
        success: true,
        session,
        reconnect_token: token,
    }))
}

pub async fn end_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<AckResponse>> {
    SessionEngine::end_session(&state, &code).await?;
    Ok(Json(AckResponse { success: true }))
}

/// Slide navigation over HTTP, projected onto the same mutation and
/// room broadcast as the realtime `update-slide`.
pub async fn set_slide(
    State(state): State<AppState>,
    Path((code, index)): Path<(String, usize)>,
) -> Result<Json<AckResponse>> {
    let slide = SessionEngine::set_slide(&state, &code, index).await?;
    state
        .registry
        .broadcast(&code, &ServerEvent::slide_change(&slide))
        .await;
    Ok(Json(AckResponse { success: true }))
}

pub async fn list_summaries(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<SummariesResponse>> {
    let session = state.store.get(&code).await?;
    let mut summaries: Vec<StudentSummary> = session
        .students
        .into_iter()
        .map(|(student_name, student)| StudentSummary {
            student_name,
            summary: student.summary,
        })
        .collect();
    summaries.sort_by(|a, b| a.student_name.cmp(&b.student_name));
    Ok(Json(SummariesResponse { success: true, summaries }))
}

pub async fn get_student_summary(
    State(state): State<AppState>,
    Path((code, name)): Path<(String, String)>,
) -> Result<Json<StudentSummaryResponse>> {
    let session = state.store.get(&code).await?;
    let student = session
        .students
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("no student named {}", name)))?;
    Ok(Json(StudentSummaryResponse {
        success: true,
        summary: student.summary.clone(),
    }))
}
