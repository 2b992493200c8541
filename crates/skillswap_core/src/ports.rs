//! crates/skillswap_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the engine's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the
//! engine to be independent of specific external implementations like the
//! database, the scoring oracle or the video provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AnalysisResult, AuthSession, Match, MatchStatus, MonitoringSnapshot, Session, User,
    UserCredentials, VideoRoom,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
///
/// `Conflict` is the stale-revision signal from optimistic saves; the engine
/// retries it internally. `InvalidState` is a state-machine precondition
/// violation and is always surfaced to the caller. Insufficient funds is
/// deliberately absent: settlement reports it as a normal boolean outcome.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Dependency unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Persistence for sessions, matches, users and auth sessions.
///
/// Save ordering contract: `save_session` must reject a write whose
/// `revision` no longer matches the stored row with `PortError::Conflict`,
/// so that concurrent read-modify-write cycles on the same session can never
/// lose an update.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // --- Users and auth ---
    async fn create_user(&self, name: &str, email: &str, hashed_password: &str)
        -> PortResult<User>;

    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn create_auth_session(&self, session: &AuthSession) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Matches ---
    async fn get_match(&self, match_id: Uuid) -> PortResult<Match>;

    async fn update_match_status(&self, match_id: Uuid, status: MatchStatus) -> PortResult<()>;

    // --- Sessions ---
    /// Inserts a new session, atomically enforcing the single-active-session
    /// invariant for its (teacher, learner, skill) triple in either
    /// orientation. Returns `InvalidState` if an active session exists.
    async fn insert_session(&self, session: &Session) -> PortResult<Session>;

    async fn fetch_session(&self, session_id: &str) -> PortResult<Session>;

    /// Persists a modified session if `session.revision` is still current,
    /// bumping the stored revision. Stale writes fail with `Conflict`.
    async fn save_session(&self, session: &Session) -> PortResult<Session>;

    async fn find_sessions_for_user(&self, user_id: Uuid) -> PortResult<Vec<Session>>;

    /// Live sessions whose wall-clock start is older than the cutoff, for the
    /// abandoned-session sweep.
    async fn find_stale_live_sessions(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Session>>;

    /// Fixed-window rate counter shared across service instances. Returns
    /// `true` while the caller is within `limit` events per window.
    async fn check_rate_limit(&self, key: &str, limit: u32, window_secs: u64) -> PortResult<bool>;
}

/// Atomic-intent transfer of the session fee.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Moves `amount` tokens from the learner to the teacher and bumps the
    /// teacher's reputation, all-or-nothing. Returns `Ok(false)` when the
    /// learner's balance is insufficient; neither balance changes in that
    /// case and no negative balance is ever produced.
    async fn settle(
        &self,
        learner: Uuid,
        teacher: Uuid,
        amount: i64,
        reputation_increment: i32,
    ) -> PortResult<bool>;
}

/// The scoring oracle. Infallible by contract: any transport, timeout or
/// malformed-response failure must be absorbed by the adapter and replaced
/// with [`AnalysisResult::neutral`], never surfaced to the pipeline.
#[async_trait]
pub trait SessionAnalysisService: Send + Sync {
    async fn analyze_snapshot(
        &self,
        snapshot: &MonitoringSnapshot,
        skill: &str,
        skill_category: &str,
    ) -> AnalysisResult;
}

/// External conferencing provider.
#[async_trait]
pub trait VideoRoomService: Send + Sync {
    async fn create_room(&self, session_id: &str, ttl_minutes: u32) -> PortResult<VideoRoom>;

    /// Idempotent: deleting an already-gone room is not an error.
    async fn delete_room(&self, room_name: &str) -> PortResult<()>;

    /// Best-effort access token for a private room; may be empty for
    /// providers without token auth.
    async fn issue_access_token(
        &self,
        room_name: &str,
        user_id: Uuid,
        is_owner: bool,
    ) -> PortResult<String>;
}

/// Events a session operation emits as side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionEnded { session_id: String, status: String },
    FraudFlagged { session_id: String },
}

/// Fire-and-forget notification sink. Failures are logged by the engine and
/// never abort the operation that triggered them.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: SessionEvent) -> PortResult<()>;
}
