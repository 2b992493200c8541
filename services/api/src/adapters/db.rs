//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `SessionStore`, `TokenLedger` and `NotificationService` ports from the
//! `core` crate. It handles all interactions with the PostgreSQL database using
//! `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use skillswap_core::domain::{
    AiWindow, AuthSession, Match, MatchStatus, ReadyStatus, Session, SessionStatus, TokenStatus,
    User, UserCredentials,
};
use skillswap_core::ports::{
    NotificationService, PortError, PortResult, SessionEvent, SessionStore, TokenLedger,
};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter backing all persistence ports with PostgreSQL.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    name: String,
    email: Option<String>,
    tokens: i64,
    reputation: i32,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            name: self.name,
            email: self.email,
            tokens: self.tokens,
            reputation: self.reputation,
        }
    }
}

#[derive(FromRow)]
struct MatchRecord {
    id: Uuid,
    learner: Uuid,
    teacher: Uuid,
    skill: String,
    skill_category: String,
    match_score: f64,
    reason: String,
    status: String,
    expires_at: DateTime<Utc>,
}
impl MatchRecord {
    fn to_domain(self) -> PortResult<Match> {
        let status = self
            .status
            .parse::<MatchStatus>()
            .map_err(PortError::Unexpected)?;
        Ok(Match {
            id: self.id,
            learner: self.learner,
            teacher: self.teacher,
            skill: self.skill,
            skill_category: self.skill_category,
            match_score: self.match_score,
            reason: self.reason,
            status,
            expires_at: self.expires_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    session_id: String,
    room_name: String,
    room_url: String,
    teacher: Uuid,
    learner: Uuid,
    skill: String,
    skill_category: String,
    status: String,
    teacher_ready: bool,
    learner_ready: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    duration_minutes: Option<i64>,
    ai_windows: Json<Vec<AiWindow>>,
    final_engagement_score: Option<f64>,
    final_teaching_score: Option<f64>,
    final_participation_score: Option<f64>,
    fraud_flagged: bool,
    token_status: String,
    tokens_transferred: bool,
    tokens_amount: Option<i64>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<Session> {
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(PortError::Unexpected)?;
        let token_status = self
            .token_status
            .parse::<TokenStatus>()
            .map_err(PortError::Unexpected)?;
        Ok(Session {
            id: self.id,
            session_id: self.session_id,
            room_name: self.room_name,
            room_url: self.room_url,
            teacher: self.teacher,
            learner: self.learner,
            participants: vec![self.teacher, self.learner],
            skill: self.skill,
            skill_category: self.skill_category,
            status,
            ready: ReadyStatus {
                teacher: self.teacher_ready,
                learner: self.learner_ready,
            },
            start_time: self.start_time,
            end_time: self.end_time,
            duration_minutes: self.duration_minutes,
            ai_windows: self.ai_windows.0,
            final_engagement_score: self.final_engagement_score,
            final_teaching_score: self.final_teaching_score,
            final_participation_score: self.final_participation_score,
            fraud_flagged: self.fraud_flagged,
            token_status,
            tokens_transferred: self.tokens_transferred,
            tokens_amount: self.tokens_amount,
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SESSION_COLUMNS: &str = "id, session_id, room_name, room_url, teacher, learner, skill, \
     skill_category, status, teacher_ready, learner_ready, start_time, end_time, \
     duration_minutes, ai_windows, final_engagement_score, final_teaching_score, \
     final_participation_score, fraud_flagged, token_status, tokens_transferred, \
     tokens_amount, revision, created_at, updated_at";

//=========================================================================================
// `SessionStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionStore for DbAdapter {
    async fn create_user(
        &self,
        name: &str,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (user_id, name, email, hashed_password) \
             VALUES ($1, $2, $3, $4) \
             RETURNING user_id, name, email, tokens, reputation",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(email)
        .bind(hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PortError::InvalidState(format!("a user with email {} already exists", email))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, name, email, tokens, reputation FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", user_id)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let row = sqlx::query(
            "SELECT user_id, email, hashed_password FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("User with email {} not found", email))
            }
            _ => unexpected(e),
        })?;
        Ok(UserCredentials {
            user_id: row.get("user_id"),
            email: row.get("email"),
            hashed_password: row.get("hashed_password"),
        })
    }

    async fn create_auth_session(&self, session: &AuthSession) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&session.id)
            .bind(session.user_id)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let row = sqlx::query(
            "SELECT user_id FROM auth_sessions WHERE id = $1 AND expires_at > NOW()",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound("Auth session not found".to_string()),
            _ => unexpected(e),
        })?;
        Ok(row.get("user_id"))
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn get_match(&self, match_id: Uuid) -> PortResult<Match> {
        let record = sqlx::query_as::<_, MatchRecord>(
            "SELECT id, learner, teacher, skill, skill_category, match_score, reason, status, \
             expires_at FROM matches WHERE id = $1",
        )
        .bind(match_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Match {} not found", match_id))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn update_match_status(&self, match_id: Uuid, status: MatchStatus) -> PortResult<()> {
        let result = sqlx::query("UPDATE matches SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(match_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Match {} not found", match_id)));
        }
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> PortResult<Session> {
        let mut tx: Transaction<'_, Postgres> =
            self.pool.begin().await.map_err(unexpected)?;

        // Serialize competing inserts for the same pair and skill, then
        // check for an active duplicate in either role orientation.
        let pair_key = pair_lock_key(session.teacher, session.learner, &session.skill);
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&pair_key)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        let active: Vec<&str> = SessionStatus::ACTIVE.iter().map(|s| s.as_str()).collect();
        let duplicate: bool = sqlx::query_scalar(
            "SELECT EXISTS( \
                 SELECT 1 FROM sessions \
                 WHERE skill = $1 \
                   AND status = ANY($4) \
                   AND ((teacher = $2 AND learner = $3) OR (teacher = $3 AND learner = $2)))",
        )
        .bind(&session.skill)
        .bind(session.teacher)
        .bind(session.learner)
        .bind(&active)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;
        if duplicate {
            return Err(PortError::InvalidState(
                "an active session already exists for this pair and skill".to_string(),
            ));
        }

        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "INSERT INTO sessions (id, session_id, room_name, room_url, teacher, learner, \
             skill, skill_category, status, teacher_ready, learner_ready, ai_windows, \
             fraud_flagged, token_status, tokens_transferred, revision, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session.id)
        .bind(&session.session_id)
        .bind(&session.room_name)
        .bind(&session.room_url)
        .bind(session.teacher)
        .bind(session.learner)
        .bind(&session.skill)
        .bind(&session.skill_category)
        .bind(session.status.as_str())
        .bind(session.ready.teacher)
        .bind(session.ready.learner)
        .bind(Json(&session.ai_windows))
        .bind(session.fraud_flagged)
        .bind(session.token_status.as_str())
        .bind(session.tokens_transferred)
        .bind(session.revision)
        .bind(session.created_at)
        .bind(session.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        record.to_domain()
    }

    async fn fetch_session(&self, session_id: &str) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Session {} not found", session_id))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn save_session(&self, session: &Session) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "UPDATE sessions SET \
                 status = $1, teacher_ready = $2, learner_ready = $3, start_time = $4, \
                 end_time = $5, duration_minutes = $6, ai_windows = $7, \
                 final_engagement_score = $8, final_teaching_score = $9, \
                 final_participation_score = $10, fraud_flagged = $11, token_status = $12, \
                 tokens_transferred = $13, tokens_amount = $14, \
                 revision = revision + 1, updated_at = NOW() \
             WHERE session_id = $15 AND revision = $16 \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session.status.as_str())
        .bind(session.ready.teacher)
        .bind(session.ready.learner)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.duration_minutes)
        .bind(Json(&session.ai_windows))
        .bind(session.final_engagement_score)
        .bind(session.final_teaching_score)
        .bind(session.final_participation_score)
        .bind(session.fraud_flagged)
        .bind(session.token_status.as_str())
        .bind(session.tokens_transferred)
        .bind(session.tokens_amount)
        .bind(&session.session_id)
        .bind(session.revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        match record {
            Some(record) => record.to_domain(),
            // Distinguish a stale revision from a missing row.
            None => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE session_id = $1)",
                )
                .bind(&session.session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(unexpected)?;
                if exists {
                    Err(PortError::Conflict(format!(
                        "revision {} of session {} is stale",
                        session.revision, session.session_id
                    )))
                } else {
                    Err(PortError::NotFound(format!(
                        "Session {} not found",
                        session.session_id
                    )))
                }
            }
        }
    }

    async fn find_sessions_for_user(&self, user_id: Uuid) -> PortResult<Vec<Session>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE teacher = $1 OR learner = $1 \
             ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(SessionRecord::to_domain).collect()
    }

    async fn find_stale_live_sessions(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Session>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE status = 'live' AND start_time < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(SessionRecord::to_domain).collect()
    }

    async fn check_rate_limit(&self, key: &str, limit: u32, window_secs: u64) -> PortResult<bool> {
        let count: i32 = sqlx::query_scalar(
            "INSERT INTO rate_limits (key, window_start, count) \
             VALUES ($1, to_timestamp(floor(extract(epoch FROM now()) / $2) * $2), 1) \
             ON CONFLICT (key, window_start) \
             DO UPDATE SET count = rate_limits.count + 1 \
             RETURNING count",
        )
        .bind(key)
        .bind(window_secs as f64)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;

        // Expired windows for this key are dead rows; dropping them here
        // keeps the table bounded by one live row per key.
        sqlx::query(
            "DELETE FROM rate_limits \
             WHERE key = $1 \
               AND window_start < to_timestamp(floor(extract(epoch FROM now()) / $2) * $2)",
        )
        .bind(key)
        .bind(window_secs as f64)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(count <= limit as i32)
    }
}

/// A stable lock key for a (pair, skill) triple, independent of who teaches.
fn pair_lock_key(a: Uuid, b: Uuid, skill: &str) -> String {
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    format!("{low}:{high}:{skill}")
}

//=========================================================================================
// `TokenLedger` Trait Implementation
//=========================================================================================

#[async_trait]
impl TokenLedger for DbAdapter {
    async fn settle(
        &self,
        learner: Uuid,
        teacher: Uuid,
        amount: i64,
        reputation_increment: i32,
    ) -> PortResult<bool> {
        let mut tx: Transaction<'_, Postgres> =
            self.pool.begin().await.map_err(unexpected)?;

        // The balance guard is part of the debit itself, so concurrent
        // settlements for the same learner can never drive tokens negative.
        let debited = sqlx::query(
            "UPDATE users SET tokens = tokens - $1 WHERE user_id = $2 AND tokens >= $1",
        )
        .bind(amount)
        .bind(learner)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        if debited.rows_affected() == 0 {
            tx.rollback().await.map_err(unexpected)?;
            return Ok(false);
        }

        let credited = sqlx::query(
            "UPDATE users SET tokens = tokens + $1, reputation = reputation + $2 \
             WHERE user_id = $3",
        )
        .bind(amount)
        .bind(reputation_increment)
        .bind(teacher)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        if credited.rows_affected() == 0 {
            tx.rollback().await.map_err(unexpected)?;
            return Err(PortError::NotFound(format!("User {} not found", teacher)));
        }

        tx.commit().await.map_err(unexpected)?;
        Ok(true)
    }
}

//=========================================================================================
// `NotificationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl NotificationService for DbAdapter {
    async fn notify(&self, user_id: Uuid, event: SessionEvent) -> PortResult<()> {
        let (event_type, payload) = match &event {
            SessionEvent::SessionEnded { session_id, status } => (
                "session_ended",
                json!({ "session_id": session_id, "status": status }),
            ),
            SessionEvent::FraudFlagged { session_id } => {
                ("fraud_flagged", json!({ "session_id": session_id }))
            }
        };
        sqlx::query(
            "INSERT INTO notifications (id, user_id, event_type, payload) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }
}
