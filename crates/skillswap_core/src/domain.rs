//! crates/skillswap_core/src/domain.rs
//!
//! Defines the pure, core data structures for the session engine.
//! These structs are independent of any database or transport format;
//! serde derives exist only so the monitoring history can round-trip
//! through storage unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Lifecycle enums
//=========================================================================================

/// Lifecycle state of a teaching session.
///
/// `UnderReview`, `Completed` and `Cancelled` are terminal from the engine's
/// point of view; a session in one of those states accepts no further
/// monitoring or finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Scheduled,
    Live,
    UnderReview,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// States that count against the single-active-session invariant. Every
    /// duplicate check, in-memory or SQL, derives from this list.
    pub const ACTIVE: [SessionStatus; 3] = [
        SessionStatus::Created,
        SessionStatus::Scheduled,
        SessionStatus::Live,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::UnderReview | SessionStatus::Completed | SessionStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Live => "live",
            SessionStatus::UnderReview => "under_review",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionStatus::Created),
            "scheduled" => Ok(SessionStatus::Scheduled),
            "live" => Ok(SessionStatus::Live),
            "under_review" => Ok(SessionStatus::UnderReview),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Settlement state of the session fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Frozen,
    Distributed,
}

impl TokenStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Pending => "pending",
            TokenStatus::Frozen => "frozen",
            TokenStatus::Distributed => "distributed",
        }
    }
}

impl std::str::FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TokenStatus::Pending),
            "frozen" => Ok(TokenStatus::Frozen),
            "distributed" => Ok(TokenStatus::Distributed),
            other => Err(format!("unknown token status '{other}'")),
        }
    }
}

/// Which side of the session a participant is on. Roles are assigned by the
/// match that produced the session and are never re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Teacher,
    Learner,
}

//=========================================================================================
// Monitoring telemetry
//=========================================================================================

/// Raw behavioral signals for one participant within a monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantActivity {
    #[serde(default)]
    pub speaking: bool,
    #[serde(default = "default_camera_on")]
    pub camera_on: bool,
    /// Seconds of continuous silence, if the client measured it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_duration: Option<u32>,
}

fn default_camera_on() -> bool {
    true
}

impl Default for ParticipantActivity {
    fn default() -> Self {
        Self {
            speaking: false,
            camera_on: true,
            silence_duration: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerActivity {
    pub teacher: ParticipantActivity,
    pub learner: ParticipantActivity,
}

/// Per-window speaking-time accumulators reported by the clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionMetrics {
    #[serde(default)]
    pub teacher_speaking_time: u32,
    #[serde(default)]
    pub learner_speaking_time: u32,
    #[serde(default)]
    pub question_count: u32,
    #[serde(default)]
    pub has_two_way_interaction: bool,
}

/// One periodic behavioral snapshot submitted by either client while the
/// session is live.
#[derive(Debug, Clone, Default)]
pub struct MonitoringSnapshot {
    pub transcript: Option<String>,
    pub speaker_activity: Option<SpeakerActivity>,
    pub interaction_metrics: Option<InteractionMetrics>,
}

//=========================================================================================
// Oracle output
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LectureQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// The classifier's verdict for one snapshot, validated and defaulted exactly
/// once at the adapter boundary. All scores are within [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub engagement_score: f64,
    pub teaching_score: f64,
    pub participation_score: f64,
    pub fraud_detected: bool,
    pub notes: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lecture_quality: Option<LectureQuality>,
    #[serde(default)]
    pub key_strengths: Vec<String>,
    #[serde(default)]
    pub improvement_areas: Vec<String>,
}

impl AnalysisResult {
    /// The neutral verdict used whenever the external classifier cannot be
    /// reached or returns garbage.
    pub fn neutral() -> Self {
        Self {
            engagement_score: 50.0,
            teaching_score: 50.0,
            participation_score: 50.0,
            fraud_detected: false,
            notes: "AI analysis unavailable, using default scores".to_string(),
            recommendations: Vec::new(),
            lecture_quality: None,
            key_strengths: Vec::new(),
            improvement_areas: Vec::new(),
        }
    }

    pub fn mean_score(&self) -> f64 {
        (self.engagement_score + self.teaching_score + self.participation_score) / 3.0
    }
}

/// One appended entry of the session's monitoring history. Immutable after
/// append except for the fraud-flag propagation performed by the ingest step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiWindow {
    /// Gapless, zero-based: the Nth snapshot becomes window N-1.
    pub window_index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_activity: Option<SpeakerActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_metrics: Option<InteractionMetrics>,
    pub engagement_score: f64,
    pub teaching_score: f64,
    pub participation_score: f64,
    pub fraud_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub analysis: AnalysisResult,
}

//=========================================================================================
// Session
//=========================================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyStatus {
    pub teacher: bool,
    pub learner: bool,
}

/// The central entity: one live teaching session between a matched pair.
#[derive(Debug, Clone)]
pub struct Session {
    /// Storage identity.
    pub id: Uuid,
    /// External identifier handed to clients and the room provider.
    pub session_id: String,
    pub room_name: String,
    pub room_url: String,
    pub teacher: Uuid,
    pub learner: Uuid,
    /// Superset of the two parties, kept for group-tolerant lookups.
    pub participants: Vec<Uuid>,
    pub skill: String,
    pub skill_category: String,
    pub status: SessionStatus,
    pub ready: ReadyStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole minutes, floored, computed at finalization.
    pub duration_minutes: Option<i64>,
    pub ai_windows: Vec<AiWindow>,
    pub final_engagement_score: Option<f64>,
    pub final_teaching_score: Option<f64>,
    pub final_participation_score: Option<f64>,
    /// Monotonic: once true it is never reset within a session.
    pub fraud_flagged: bool,
    pub token_status: TokenStatus,
    pub tokens_transferred: bool,
    pub tokens_amount: Option<i64>,
    /// Optimistic concurrency counter, bumped by the store on every save.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn participant_role(&self, user_id: Uuid) -> Option<SessionRole> {
        if self.teacher == user_id {
            Some(SessionRole::Teacher)
        } else if self.learner == user_id {
            Some(SessionRole::Learner)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participant_role(user_id).is_some() || self.participants.contains(&user_id)
    }

    pub fn both_ready(&self) -> bool {
        self.ready.teacher && self.ready.learner
    }

    /// Appends a window, stamping it with the next gapless index.
    pub fn append_window(&mut self, mut window: AiWindow) -> usize {
        let index = self.ai_windows.len();
        window.window_index = index;
        self.ai_windows.push(window);
        index
    }

    /// The one-way fraud ratchet: flags the session, freezes settlement and
    /// moves it under review. Never the reverse.
    pub fn flag_fraud(&mut self) {
        self.fraud_flagged = true;
        self.token_status = TokenStatus::Frozen;
        self.status = SessionStatus::UnderReview;
    }

    /// Arithmetic means of the per-window scores, `None` with zero windows.
    pub fn mean_scores(&self) -> Option<ScoreTriple> {
        if self.ai_windows.is_empty() {
            return None;
        }
        let n = self.ai_windows.len() as f64;
        let mut engagement = 0.0;
        let mut teaching = 0.0;
        let mut participation = 0.0;
        for w in &self.ai_windows {
            engagement += w.engagement_score;
            teaching += w.teaching_score;
            participation += w.participation_score;
        }
        Some(ScoreTriple {
            engagement: engagement / n,
            teaching: teaching / n,
            participation: participation / n,
        })
    }
}

/// Running or final aggregate of the three monitoring scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTriple {
    pub engagement: f64,
    pub teaching: f64,
    pub participation: f64,
}

//=========================================================================================
// Match (upstream collaborator)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Accepted => "accepted",
            MatchStatus::Rejected => "rejected",
            MatchStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MatchStatus::Pending),
            "accepted" => Ok(MatchStatus::Accepted),
            "rejected" => Ok(MatchStatus::Rejected),
            "expired" => Ok(MatchStatus::Expired),
            other => Err(format!("unknown match status '{other}'")),
        }
    }
}

/// An algorithmic pairing of a learner with a teacher for one skill. A match
/// transitions to `Accepted` exactly once, when a session is created from it.
#[derive(Debug, Clone)]
pub struct Match {
    pub id: Uuid,
    pub learner: Uuid,
    pub teacher: Uuid,
    pub skill: String,
    pub skill_category: String,
    pub match_score: f64,
    pub reason: String,
    pub status: MatchStatus,
    pub expires_at: DateTime<Utc>,
}

//=========================================================================================
// Users and rooms
//=========================================================================================

// Represents a user - used throughout the engine.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub tokens: i64,
    pub reputation: i32,
}

// Only used internally for login/signup - contains sensitive data.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

// Represents a browser login session (auth cookie).
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A provisioned conference room at the external video provider.
#[derive(Debug, Clone)]
pub struct VideoRoom {
    pub name: String,
    pub url: String,
}
