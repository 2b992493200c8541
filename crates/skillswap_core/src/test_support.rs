//! crates/skillswap_core/src/test_support.rs
//!
//! In-memory port implementations for exercising the engine without a
//! database or external providers. The memory store honors the same
//! revision contract as the real store, including injectable stale-save
//! conflicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{
    AnalysisResult, AuthSession, Match, MatchStatus, MonitoringSnapshot, Session, SessionStatus,
    TokenStatus, User, UserCredentials, VideoRoom,
};
use crate::ports::{
    NotificationService, PortError, PortResult, SessionAnalysisService, SessionEvent,
    SessionStore, TokenLedger, VideoRoomService,
};

/// Seeds a fresh pending match between two new users.
pub fn seeded_match(store: &MemoryStore) -> Match {
    let pairing = Match {
        id: Uuid::new_v4(),
        learner: Uuid::new_v4(),
        teacher: Uuid::new_v4(),
        skill: "rust".to_string(),
        skill_category: "programming".to_string(),
        match_score: 0.9,
        reason: "shared interest".to_string(),
        status: MatchStatus::Pending,
        expires_at: Utc::now() + Duration::days(1),
    };
    store.put_match(pairing.clone());
    pairing
}

//=========================================================================================
// Store
//=========================================================================================

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    matches: Mutex<HashMap<Uuid, Match>>,
    users: Mutex<HashMap<Uuid, User>>,
    auth_sessions: Mutex<HashMap<String, AuthSession>>,
    rate_windows: Mutex<HashMap<String, (i64, u32)>>,
    conflicts_to_inject: AtomicU32,
    reject_settlement_records: AtomicBool,
}

impl MemoryStore {
    pub fn put_match(&self, pairing: Match) {
        self.matches.lock().unwrap().insert(pairing.id, pairing);
    }

    /// The next `n` saves fail with `Conflict` without touching the stored
    /// row, simulating lost optimistic races.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts_to_inject.store(n, Ordering::SeqCst);
    }

    /// Every save that would record a distributed fee fails with `Conflict`,
    /// simulating a store that goes bad between settlement and its record.
    pub fn reject_settlement_records(&self) {
        self.reject_settlement_records.store(true, Ordering::SeqCst);
    }

    /// Number of rate-limit windows currently held.
    pub fn rate_rows(&self) -> usize {
        self.rate_windows.lock().unwrap().len()
    }

    /// Shifts a session's start time into the past for sweep tests.
    pub fn backdate_start(&self, session_id: &str, by: Duration) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).unwrap();
        session.start_time = session.start_time.map(|t| t - by);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_user(
        &self,
        name: &str,
        email: &str,
        _hashed_password: &str,
    ) -> PortResult<User> {
        let user = User {
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            email: Some(email.to_string()),
            tokens: 0,
            reputation: 0,
        };
        self.users.lock().unwrap().insert(user.user_id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("user {user_id}")))
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        Err(PortError::NotFound(format!("user with email {email}")))
    }

    async fn create_auth_session(&self, session: &AuthSession) -> PortResult<()> {
        self.auth_sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        self.auth_sessions
            .lock()
            .unwrap()
            .get(session_id)
            .filter(|s| s.expires_at > Utc::now())
            .map(|s| s.user_id)
            .ok_or_else(|| PortError::NotFound("auth session".to_string()))
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.auth_sessions.lock().unwrap().remove(session_id);
        Ok(())
    }

    async fn get_match(&self, match_id: Uuid) -> PortResult<Match> {
        self.matches
            .lock()
            .unwrap()
            .get(&match_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("match {match_id}")))
    }

    async fn update_match_status(&self, match_id: Uuid, status: MatchStatus) -> PortResult<()> {
        let mut matches = self.matches.lock().unwrap();
        let pairing = matches
            .get_mut(&match_id)
            .ok_or_else(|| PortError::NotFound(format!("match {match_id}")))?;
        pairing.status = status;
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> PortResult<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let duplicate = sessions.values().any(|existing| {
            existing.status.is_active()
                && existing.skill == session.skill
                && ((existing.teacher == session.teacher && existing.learner == session.learner)
                    || (existing.teacher == session.learner
                        && existing.learner == session.teacher))
        });
        if duplicate {
            return Err(PortError::InvalidState(
                "an active session already exists for this pair and skill".to_string(),
            ));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session.clone())
    }

    async fn fetch_session(&self, session_id: &str) -> PortResult<Session> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("session {session_id}")))
    }

    async fn save_session(&self, session: &Session) -> PortResult<Session> {
        if self
            .conflicts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PortError::Conflict("injected".to_string()));
        }
        if self.reject_settlement_records.load(Ordering::SeqCst)
            && session.token_status == TokenStatus::Distributed
        {
            return Err(PortError::Conflict("injected".to_string()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        let stored = sessions
            .get_mut(&session.session_id)
            .ok_or_else(|| PortError::NotFound(format!("session {}", session.session_id)))?;
        if stored.revision != session.revision {
            return Err(PortError::Conflict(format!(
                "revision {} is stale, current is {}",
                session.revision, stored.revision
            )));
        }
        let mut updated = session.clone();
        updated.revision += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn find_sessions_for_user(&self, user_id: Uuid) -> PortResult<Vec<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_participant(user_id))
            .cloned()
            .collect())
    }

    async fn find_stale_live_sessions(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == SessionStatus::Live
                    && s.start_time.map(|t| t < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn check_rate_limit(&self, key: &str, limit: u32, window_secs: u64) -> PortResult<bool> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_secs as i64);
        let mut windows = self.rate_windows.lock().unwrap();
        // Only the current window is kept per key, matching the pruning the
        // real store does.
        let entry = windows.entry(key.to_string()).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 += 1;
        Ok(entry.1 <= limit)
    }
}

//=========================================================================================
// Ledger
//=========================================================================================

#[derive(Default)]
pub struct MemoryLedger {
    accounts: Mutex<HashMap<Uuid, (i64, i32)>>,
}

impl MemoryLedger {
    pub fn credit(&self, user_id: Uuid, tokens: i64) {
        self.accounts.lock().unwrap().entry(user_id).or_default().0 += tokens;
    }

    pub fn balance(&self, user_id: Uuid) -> i64 {
        self.accounts
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|(tokens, _)| *tokens)
            .unwrap_or(0)
    }

    pub fn reputation(&self, user_id: Uuid) -> i32 {
        self.accounts
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|(_, reputation)| *reputation)
            .unwrap_or(0)
    }
}

#[async_trait]
impl TokenLedger for MemoryLedger {
    async fn settle(
        &self,
        learner: Uuid,
        teacher: Uuid,
        amount: i64,
        reputation_increment: i32,
    ) -> PortResult<bool> {
        let mut accounts = self.accounts.lock().unwrap();
        let learner_balance = accounts.entry(learner).or_default().0;
        if learner_balance < amount {
            return Ok(false);
        }
        accounts.entry(learner).or_default().0 -= amount;
        let teacher_account = accounts.entry(teacher).or_default();
        teacher_account.0 += amount;
        teacher_account.1 += reputation_increment;
        Ok(true)
    }
}

//=========================================================================================
// Oracle, rooms, notifier
//=========================================================================================

/// Returns queued results in order, then neutral ones. Counts calls.
#[derive(Default)]
pub struct StubOracle {
    queue: Mutex<Vec<AnalysisResult>>,
    call_count: AtomicUsize,
}

impl StubOracle {
    pub fn push(&self, result: AnalysisResult) {
        self.queue.lock().unwrap().push(result);
    }

    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAnalysisService for StubOracle {
    async fn analyze_snapshot(
        &self,
        _snapshot: &MonitoringSnapshot,
        _skill: &str,
        _skill_category: &str,
    ) -> AnalysisResult {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            AnalysisResult::neutral()
        } else {
            queue.remove(0)
        }
    }
}

/// Rooms named after the session, reachable at a fake URL.
#[derive(Default)]
pub struct UrlRooms;

#[async_trait]
impl VideoRoomService for UrlRooms {
    async fn create_room(&self, session_id: &str, _ttl_minutes: u32) -> PortResult<VideoRoom> {
        Ok(VideoRoom {
            name: format!("room-{session_id}"),
            url: format!("https://rooms.test/room-{session_id}"),
        })
    }

    async fn delete_room(&self, _room_name: &str) -> PortResult<()> {
        Ok(())
    }

    async fn issue_access_token(
        &self,
        _room_name: &str,
        _user_id: Uuid,
        _is_owner: bool,
    ) -> PortResult<String> {
        Ok(String::new())
    }
}

pub struct FailingRooms {
    fail_create: bool,
}

impl FailingRooms {
    /// Rooms that provision fine but refuse to tear down.
    pub fn teardown_only() -> Self {
        Self { fail_create: false }
    }

    /// Rooms where even provisioning is down.
    pub fn create_too() -> Self {
        Self { fail_create: true }
    }
}

#[async_trait]
impl VideoRoomService for FailingRooms {
    async fn create_room(&self, session_id: &str, _ttl_minutes: u32) -> PortResult<VideoRoom> {
        if self.fail_create {
            return Err(PortError::Unavailable("room provider down".to_string()));
        }
        Ok(VideoRoom {
            name: format!("room-{session_id}"),
            url: format!("https://rooms.test/room-{session_id}"),
        })
    }

    async fn delete_room(&self, _room_name: &str) -> PortResult<()> {
        Err(PortError::Unavailable("room provider down".to_string()))
    }

    async fn issue_access_token(
        &self,
        _room_name: &str,
        _user_id: Uuid,
        _is_owner: bool,
    ) -> PortResult<String> {
        Err(PortError::Unavailable("room provider down".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, SessionEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(Uuid, SessionEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, event: SessionEvent) -> PortResult<()> {
        self.events.lock().unwrap().push((user_id, event));
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl NotificationService for FailingNotifier {
    async fn notify(&self, _user_id: Uuid, _event: SessionEvent) -> PortResult<()> {
        Err(PortError::Unavailable("notification sink down".to_string()))
    }
}
