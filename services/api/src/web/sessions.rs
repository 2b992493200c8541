//! services/api/src/web/sessions.rs
//!
//! Contains the Axum handlers for the session REST endpoints and the master
//! definition for the OpenAPI specification.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::web::auth::{AuthResponse, LoginRequest, SignupRequest};
use crate::web::state::AppState;
use skillswap_core::domain::{
    InteractionMetrics, MonitoringSnapshot, ParticipantActivity, Session, SpeakerActivity,
};
use skillswap_core::engine::{EndTrigger, MonitorOutcome, SessionSummary};
use skillswap_core::ports::PortError;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::web::auth::signup_handler,
        crate::web::auth::login_handler,
        crate::web::auth::logout_handler,
        create_session_handler,
        list_sessions_handler,
        get_session_handler,
        mark_ready_handler,
        monitor_session_handler,
        end_session_handler,
        cancel_session_handler,
    ),
    components(
        schemas(
            SignupRequest,
            LoginRequest,
            AuthResponse,
            CreateSessionRequest,
            MonitorRequest,
            SpeakerActivityPayload,
            ParticipantActivityPayload,
            InteractionMetricsPayload,
            EndSessionRequest,
            SessionResponse,
            ReadyPayload,
            MonitorResponse,
            SessionSummaryResponse,
        )
    ),
    tags(
        (name = "SkillSwap Sessions API", description = "API endpoints for the peer-to-peer skill exchange session engine.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    #[serde(alias = "matchId")]
    pub match_id: Uuid,
}

/// One behavioral snapshot submitted by a client. All parts are optional;
/// older clients label the two sides `participant1`/`participant2`.
#[derive(Deserialize, ToSchema)]
pub struct MonitorRequest {
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default, alias = "speakerActivity")]
    pub speaker_activity: Option<SpeakerActivityPayload>,
    #[serde(default, alias = "interactionMetrics")]
    pub interaction_metrics: Option<InteractionMetricsPayload>,
}

#[derive(Deserialize, ToSchema)]
pub struct SpeakerActivityPayload {
    #[serde(alias = "participant1")]
    pub teacher: ParticipantActivityPayload,
    #[serde(alias = "participant2")]
    pub learner: ParticipantActivityPayload,
}

#[derive(Deserialize, ToSchema)]
pub struct ParticipantActivityPayload {
    #[serde(default)]
    pub speaking: bool,
    #[serde(default = "default_camera_on", alias = "cameraOn")]
    pub camera_on: bool,
    #[serde(default, alias = "silenceDuration")]
    pub silence_duration: Option<u32>,
}

fn default_camera_on() -> bool {
    true
}

#[derive(Deserialize, ToSchema)]
pub struct InteractionMetricsPayload {
    #[serde(default, alias = "teacherSpeakingTime")]
    pub teacher_speaking_time: u32,
    #[serde(default, alias = "learnerSpeakingTime")]
    pub learner_speaking_time: u32,
    #[serde(default, alias = "questionCount")]
    pub question_count: u32,
    #[serde(default, alias = "hasTwoWayInteraction")]
    pub has_two_way_interaction: bool,
}

#[derive(Deserialize, Default, ToSchema)]
pub struct EndSessionRequest {
    /// "disconnect" marks an automatically detected drop rather than an
    /// explicit end request.
    #[serde(default)]
    pub reason: Option<String>,
}

impl MonitorRequest {
    fn into_domain(self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            transcript: self.transcript,
            speaker_activity: self.speaker_activity.map(|a| SpeakerActivity {
                teacher: a.teacher.into_domain(),
                learner: a.learner.into_domain(),
            }),
            interaction_metrics: self.interaction_metrics.map(|m| InteractionMetrics {
                teacher_speaking_time: m.teacher_speaking_time,
                learner_speaking_time: m.learner_speaking_time,
                question_count: m.question_count,
                has_two_way_interaction: m.has_two_way_interaction,
            }),
        }
    }
}

impl ParticipantActivityPayload {
    fn into_domain(self) -> ParticipantActivity {
        ParticipantActivity {
            speaking: self.speaking,
            camera_on: self.camera_on,
            silence_duration: self.silence_duration,
        }
    }
}

//=========================================================================================
// API Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct ReadyPayload {
    pub teacher: bool,
    pub learner: bool,
}

/// The session as presented to its participants.
#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
    pub room_name: String,
    pub room_url: String,
    /// Room access token for the requesting user; empty when the provider
    /// has no token auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_token: Option<String>,
    pub teacher: Uuid,
    pub learner: Uuid,
    pub skill: String,
    pub skill_category: String,
    pub status: String,
    pub ready: ReadyPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    pub window_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_engagement_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_teaching_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_participation_score: Option<f64>,
    pub fraud_flagged: bool,
    pub token_status: String,
    pub tokens_transferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_amount: Option<i64>,
}

impl SessionResponse {
    fn from_domain(session: Session, room_token: Option<String>) -> Self {
        Self {
            session_id: session.session_id,
            room_name: session.room_name,
            room_url: session.room_url,
            room_token,
            teacher: session.teacher,
            learner: session.learner,
            skill: session.skill,
            skill_category: session.skill_category,
            status: session.status.as_str().to_string(),
            ready: ReadyPayload {
                teacher: session.ready.teacher,
                learner: session.ready.learner,
            },
            start_time: session.start_time,
            end_time: session.end_time,
            duration_minutes: session.duration_minutes,
            window_count: session.ai_windows.len(),
            final_engagement_score: session.final_engagement_score,
            final_teaching_score: session.final_teaching_score,
            final_participation_score: session.final_participation_score,
            fraud_flagged: session.fraud_flagged,
            token_status: session.token_status.as_str().to_string(),
            tokens_transferred: session.tokens_transferred,
            tokens_amount: session.tokens_amount,
        }
    }
}

/// The verdict for one monitoring snapshot plus the session's state after it.
#[derive(Serialize, ToSchema)]
pub struct MonitorResponse {
    pub window_index: usize,
    pub engagement_score: f64,
    pub teaching_score: f64,
    pub participation_score: f64,
    pub fraud_detected: bool,
    pub notes: String,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lecture_quality: Option<String>,
    pub key_strengths: Vec<String>,
    pub improvement_areas: Vec<String>,
    pub session_status: String,
    pub token_status: String,
}

impl MonitorResponse {
    fn from_outcome(outcome: MonitorOutcome) -> Self {
        let analysis = outcome.analysis;
        Self {
            window_index: outcome.window_index,
            engagement_score: analysis.engagement_score,
            teaching_score: analysis.teaching_score,
            participation_score: analysis.participation_score,
            fraud_detected: analysis.fraud_detected,
            notes: analysis.notes,
            recommendations: analysis.recommendations,
            lecture_quality: analysis
                .lecture_quality
                .map(|q| format!("{q:?}").to_lowercase()),
            key_strengths: analysis.key_strengths,
            improvement_areas: analysis.improvement_areas,
            session_status: outcome.session_status.as_str().to_string(),
            token_status: outcome.token_status.as_str().to_string(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct SessionSummaryResponse {
    pub session_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_engagement_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_teaching_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_participation_score: Option<f64>,
    pub tokens_transferred: bool,
    pub token_status: String,
}

impl SessionSummaryResponse {
    fn from_summary(summary: SessionSummary) -> Self {
        Self {
            session_id: summary.session_id,
            status: summary.status.as_str().to_string(),
            duration_minutes: summary.duration_minutes,
            final_engagement_score: summary.final_engagement_score,
            final_teaching_score: summary.final_teaching_score,
            final_participation_score: summary.final_participation_score,
            tokens_transferred: summary.tokens_transferred,
            token_status: summary.token_status.as_str().to_string(),
        }
    }
}

/// Maps a port error to the HTTP status clients see.
fn port_error_response(e: PortError) -> (StatusCode, String) {
    let status = match &e {
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::Forbidden(_) => StatusCode::FORBIDDEN,
        PortError::InvalidState(_) | PortError::Conflict(_) => StatusCode::CONFLICT,
        PortError::Unavailable(_) => StatusCode::BAD_GATEWAY,
        PortError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("session operation failed: {:?}", e);
    }
    (status, e.to_string())
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Create a session from a match.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created successfully", body = SessionResponse),
        (status = 403, description = "Requesting user is not part of the match"),
        (status = 404, description = "Match not found"),
        (status = 409, description = "Match unavailable or an active session already exists"),
        (status = 502, description = "Video room provider unavailable")
    )
)]
pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let session = state
        .engine
        .create_session(req.match_id, user_id)
        .await
        .map_err(port_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_domain(session, None)),
    ))
}

/// List the authenticated user's sessions, newest first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Sessions for the authenticated user", body = [SessionResponse])
    )
)]
pub async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let sessions = state
        .engine
        .sessions_for_user(user_id)
        .await
        .map_err(port_error_response)?;
    let payload: Vec<SessionResponse> = sessions
        .into_iter()
        .map(|s| SessionResponse::from_domain(s, None))
        .collect();
    Ok(Json(payload))
}

/// Fetch one session, with a room access token for the caller.
#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    params(("session_id" = String, Path, description = "The session identifier.")),
    responses(
        (status = 200, description = "The session", body = SessionResponse),
        (status = 403, description = "Caller is not a participant"),
        (status = 404, description = "Session not found")
    )
)]
pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (session, room_token) = state
        .engine
        .session_for(&session_id, user_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(SessionResponse::from_domain(session, Some(room_token))))
}

/// Mark the caller ready; when both sides are ready the session goes live.
#[utoipa::path(
    put,
    path = "/sessions/{session_id}/ready",
    params(("session_id" = String, Path, description = "The session identifier.")),
    responses(
        (status = 200, description = "Updated session", body = SessionResponse),
        (status = 403, description = "Caller is not a participant"),
        (status = 404, description = "Session not found")
    )
)]
pub async fn mark_ready_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let session = state
        .engine
        .mark_ready(&session_id, user_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(SessionResponse::from_domain(session, None)))
}

/// Submit a monitoring snapshot for classification.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/monitor",
    params(("session_id" = String, Path, description = "The session identifier.")),
    request_body = MonitorRequest,
    responses(
        (status = 200, description = "Snapshot classified and recorded", body = MonitorResponse),
        (status = 403, description = "Caller is not a participant"),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session is not live"),
        (status = 429, description = "Too many snapshots")
    )
)]
pub async fn monitor_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<String>,
    Json(req): Json<MonitorRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let outcome = state
        .engine
        .ingest_snapshot(&session_id, user_id, req.into_domain())
        .await
        .map_err(port_error_response)?;
    Ok(Json(MonitorResponse::from_outcome(outcome)))
}

/// End a live session, settling tokens when it completes cleanly.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/end",
    params(("session_id" = String, Path, description = "The session identifier.")),
    request_body = EndSessionRequest,
    responses(
        (status = 200, description = "Finalized session summary", body = SessionSummaryResponse),
        (status = 403, description = "Caller is not a participant"),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session is not live")
    )
)]
pub async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<String>,
    body: Option<Json<EndSessionRequest>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let trigger = match req.reason.as_deref() {
        Some("disconnect") => EndTrigger::Disconnect,
        _ => EndTrigger::Explicit,
    };
    let summary = state
        .engine
        .finalize(&session_id, Some(user_id), trigger)
        .await
        .map_err(port_error_response)?;
    Ok(Json(SessionSummaryResponse::from_summary(summary)))
}

/// Cancel a session that never went live.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/cancel",
    params(("session_id" = String, Path, description = "The session identifier.")),
    responses(
        (status = 200, description = "Cancelled session", body = SessionResponse),
        (status = 403, description = "Caller is not a participant"),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session already started or ended")
    )
)]
pub async fn cancel_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let session = state
        .engine
        .cancel(&session_id, user_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(SessionResponse::from_domain(session, None)))
}
