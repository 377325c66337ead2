// ============================
// crates/backend-lib/src/handlers.rs
// ============================
//! REST API: token endpoints, meeting lifecycle, participant management.
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppError;
use crate::meeting::{Meeting, NewMeeting};
use crate::participant::{JoinOptions, Participant, ParticipantPatch};
use crate::store::Store;
use crate::AppState;
use parley_common::UserId;

/// All REST routes, relative to the server root.
pub fn api_routes<S: Store + Clone>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/auth/token", post(issue_token))
        .route("/api/auth/refresh", post(refresh_token))
        .route("/api/auth/logout", post(logout))
        .route("/api/meetings", post(create_meeting))
        .route("/api/meetings/{code}", get(get_meeting))
        .route("/api/meetings/{code}/start", post(start_meeting))
        .route("/api/meetings/{code}/end", post(end_meeting))
        .route("/api/meetings/{code}/join", post(join_meeting))
        .route("/api/meetings/{code}/leave", post(leave_meeting))
        .route("/api/meetings/{code}/participants", get(list_participants))
        .route(
            "/api/meetings/{code}/participants/{user_id}",
            patch(update_participant),
        )
}

/// Pull the caller's user id out of the `Authorization: Bearer` header.
async fn bearer_user<S: Store + Clone>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<UserId, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthenticated("missing bearer token".to_string()))?;
    state.tokens.verify(token).await
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub token: String,
}

async fn health() -> &'static str {
    "ok"
}

async fn issue_token<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let token = state.tokens.issue(req.user_id)?;
    Ok(Json(TokenResponse { token }))
}

async fn refresh_token<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<TokenBody>,
) -> Result<Json<TokenResponse>, AppError> {
    let token = state.tokens.refresh(&req.token).await?;
    Ok(Json(TokenResponse { token }))
}

async fn logout<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<TokenBody>,
) -> Result<StatusCode, AppError> {
    state.tokens.revoke(&req.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(req): Json<NewMeeting>,
) -> Result<(StatusCode, Json<Meeting>), AppError> {
    let caller = bearer_user(&state, &headers).await?;
    let meeting = state.meetings.create(caller, req).await?;
    Ok((StatusCode::CREATED, Json(meeting)))
}

async fn get_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Meeting>, AppError> {
    bearer_user(&state, &headers).await?;
    let meeting = state.meetings.get_by_code(&code).await?;
    Ok(Json(meeting))
}

async fn start_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Meeting>, AppError> {
    let caller = bearer_user(&state, &headers).await?;
    let meeting = state.meetings.start(&code, caller).await?;
    Ok(Json(meeting))
}

async fn end_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Meeting>, AppError> {
    let caller = bearer_user(&state, &headers).await?;
    let meeting = state.meetings.end(&code, caller).await?;
    Ok(Json(meeting))
}

async fn join_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
    body: Option<Json<JoinOptions>>,
) -> Result<(StatusCode, Json<Participant>), AppError> {
    let caller = bearer_user(&state, &headers).await?;
    let opts = body.map(|Json(opts)| opts).unwrap_or_default();
    let row = state.participants.join(&code, caller, opts).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn leave_meeting<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<StatusCode, AppError> {
    let caller = bearer_user(&state, &headers).await?;
    state.participants.leave(&code, caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_participants<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Vec<Participant>>, AppError> {
    bearer_user(&state, &headers).await?;
    let active = state.participants.list_active(&code).await?;
    Ok(Json(active))
}

/// Participants may patch themselves; the host may patch anyone.
async fn update_participant<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path((code, user_id)): Path<(String, UserId)>,
    Json(req): Json<ParticipantPatch>,
) -> Result<Json<Participant>, AppError> {
    let caller = bearer_user(&state, &headers).await?;
    if caller != user_id {
        let meeting = state.meetings.get_by_code(&code).await?;
        if caller != meeting.host_id {
            return Err(AppError::Unauthorized(
                "only the host may update other participants".to_string(),
            ));
        }
    }
    let row = state.participants.update_state(&code, user_id, req).await?;
    Ok(Json(row))
}
