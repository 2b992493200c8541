//! crates/skillswap_core/src/engine.rs
//!
//! The session state machine. Owns the lifecycle of a teaching session from
//! creation out of a match, through the dual-ready handshake and periodic
//! monitoring, to finalization and token settlement.
//!
//! All mutation goes through an optimistic read-modify-write cycle against
//! the store so that concurrent calls from the two participants can never
//! lose an update; `status` is the single arbiter of which operations are
//! legal at any moment.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    AnalysisResult, MonitoringSnapshot, ParticipantActivity, ReadyStatus, Session, SessionRole,
    SessionStatus, SpeakerActivity, TokenStatus,
};
use crate::domain::{Match, MatchStatus};
use crate::ports::{
    NotificationService, PortError, PortResult, SessionAnalysisService, SessionEvent,
    SessionStore, TokenLedger, VideoRoomService,
};
use crate::{fraud, monitor};

/// Bounded retries for optimistic save conflicts before giving up.
const MAX_SAVE_ATTEMPTS: u32 = 3;

/// Tunable parameters of the engine. The fee and reputation increment are
/// deliberately configuration, not invariants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_fee_tokens: i64,
    pub reputation_increment: i32,
    pub room_ttl_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_fee_tokens: 10,
            reputation_increment: 1,
            room_ttl_minutes: 120,
        }
    }
}

/// What caused a finalization attempt. Automatic triggers treat an
/// already-terminal session as already handled; explicit ones get a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTrigger {
    Explicit,
    Disconnect,
}

/// The classification returned to the submitting client, together with the
/// session's post-update state. A fraud-triggering transition is always
/// visible here; no silent freezing.
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub analysis: AnalysisResult,
    pub window_index: usize,
    pub session_status: SessionStatus,
    pub token_status: TokenStatus,
}

/// Minimal summary of a finalized session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub duration_minutes: Option<i64>,
    pub final_engagement_score: Option<f64>,
    pub final_teaching_score: Option<f64>,
    pub final_participation_score: Option<f64>,
    pub tokens_transferred: bool,
    pub token_status: TokenStatus,
}

/// The session lifecycle and trust-scoring engine, generic over its ports.
pub struct SessionEngine {
    store: Arc<dyn SessionStore>,
    ledger: Arc<dyn TokenLedger>,
    oracle: Arc<dyn SessionAnalysisService>,
    rooms: Arc<dyn VideoRoomService>,
    notifier: Arc<dyn NotificationService>,
    config: EngineConfig,
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ledger: Arc<dyn TokenLedger>,
        oracle: Arc<dyn SessionAnalysisService>,
        rooms: Arc<dyn VideoRoomService>,
        notifier: Arc<dyn NotificationService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            rooms,
            notifier,
            config,
        }
    }

    //-------------------------------------------------------------------------------------
    // Match-to-session bridge
    //-------------------------------------------------------------------------------------

    /// Converts an accepted pairing into a session in `Created` status.
    ///
    /// The single-active-session invariant for the (teacher, learner, skill)
    /// triple is enforced transactionally by the store insert. Room creation
    /// failure escalates: a session cannot exist without a room.
    pub async fn create_session(
        &self,
        match_id: Uuid,
        requesting_user: Uuid,
    ) -> PortResult<Session> {
        let pairing: Match = self.store.get_match(match_id).await?;

        if !matches!(pairing.status, MatchStatus::Pending | MatchStatus::Accepted) {
            return Err(PortError::InvalidState(
                "match is no longer available".to_string(),
            ));
        }
        if pairing.teacher != requesting_user && pairing.learner != requesting_user {
            return Err(PortError::Forbidden(
                "you are not part of this match".to_string(),
            ));
        }

        let session_id = format!("session-{}", Uuid::new_v4());
        let room = self
            .rooms
            .create_room(&session_id, self.config.room_ttl_minutes)
            .await?;

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            room_name: room.name,
            room_url: room.url,
            teacher: pairing.teacher,
            learner: pairing.learner,
            participants: vec![pairing.teacher, pairing.learner],
            skill: pairing.skill.clone(),
            skill_category: pairing.skill_category.clone(),
            status: SessionStatus::Created,
            ready: ReadyStatus::default(),
            start_time: None,
            end_time: None,
            duration_minutes: None,
            ai_windows: Vec::new(),
            final_engagement_score: None,
            final_teaching_score: None,
            final_participation_score: None,
            fraud_flagged: false,
            token_status: TokenStatus::Pending,
            tokens_transferred: false,
            tokens_amount: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        let inserted = match self.store.insert_session(&session).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // The room was provisioned for a session that will not exist.
                if let Err(cleanup) = self.rooms.delete_room(&session.room_name).await {
                    warn!(room = %session.room_name, error = %cleanup, "failed to clean up room");
                }
                return Err(e);
            }
        };

        if pairing.status == MatchStatus::Pending {
            self.store
                .update_match_status(pairing.id, MatchStatus::Accepted)
                .await?;
        }

        info!(
            session_id = %inserted.session_id,
            skill = %inserted.skill,
            teacher = %inserted.teacher,
            learner = %inserted.learner,
            "session created from match"
        );
        Ok(inserted)
    }

    //-------------------------------------------------------------------------------------
    // Ready handshake
    //-------------------------------------------------------------------------------------

    /// Marks one participant ready. Idempotent for an already-ready actor,
    /// rejected once the session has reached a terminal state. When both
    /// flags become true while the session is `Created`, it moves to `Live`
    /// and `start_time` is stamped, exactly once.
    pub async fn mark_ready(&self, session_id: &str, actor: Uuid) -> PortResult<Session> {
        let (session, went_live) = self
            .mutate_session(session_id, |s| {
                let role = s.participant_role(actor).ok_or_else(|| {
                    PortError::Forbidden("you are not part of this session".to_string())
                })?;
                if s.status.is_terminal() {
                    return Err(PortError::InvalidState(
                        "session already ended".to_string(),
                    ));
                }
                match role {
                    SessionRole::Teacher => s.ready.teacher = true,
                    SessionRole::Learner => s.ready.learner = true,
                }
                if s.both_ready() && s.status == SessionStatus::Created {
                    s.status = SessionStatus::Live;
                    s.start_time = Some(Utc::now());
                    return Ok(true);
                }
                Ok(false)
            })
            .await?;

        if went_live {
            info!(session_id = %session.session_id, "both participants ready, session is live");
        }
        Ok(session)
    }

    //-------------------------------------------------------------------------------------
    // Monitoring ingestion
    //-------------------------------------------------------------------------------------

    /// Classifies one behavioral snapshot and appends it to the session's
    /// monitoring history. Only legal while the session is `Live`.
    pub async fn ingest_snapshot(
        &self,
        session_id: &str,
        actor: Uuid,
        snapshot: MonitoringSnapshot,
    ) -> PortResult<MonitorOutcome> {
        // Check preconditions before paying for an oracle round-trip. The
        // authoritative check happens again inside the serialized mutation.
        let session = self.store.fetch_session(session_id).await?;
        if !session.is_participant(actor) {
            return Err(PortError::Forbidden(
                "you are not part of this session".to_string(),
            ));
        }
        if session.status != SessionStatus::Live {
            return Err(PortError::InvalidState("session is not live".to_string()));
        }

        // The oracle sees an enriched transcript; the stored window keeps the
        // raw one.
        let enriched = MonitoringSnapshot {
            transcript: Some(monitor::enrich_transcript(&snapshot)),
            speaker_activity: Some(snapshot.speaker_activity.clone().unwrap_or_default()),
            interaction_metrics: snapshot.interaction_metrics.clone(),
        };
        let mut analysis = self
            .oracle
            .analyze_snapshot(&enriched, &session.skill, &session.skill_category)
            .await;

        let (session, (window_index, fraud_detected)) = self
            .mutate_session(session_id, |s| {
                if !s.is_participant(actor) {
                    return Err(PortError::Forbidden(
                        "you are not part of this session".to_string(),
                    ));
                }
                if s.status != SessionStatus::Live {
                    return Err(PortError::InvalidState("session is not live".to_string()));
                }

                // Heuristics run over the raw snapshot; verdicts are ORed and
                // the combined result is a one-way ratchet.
                let prior_windows = s.ai_windows.len();
                let fraud =
                    analysis.fraud_detected || fraud::evaluate(&snapshot, prior_windows);

                let mut window = monitor::build_window(&snapshot, &analysis, fraud);
                if fraud {
                    window.notes = Some(
                        format!("{} Fraud detected: fraud indicators present", analysis.notes)
                            .trim()
                            .to_string(),
                    );
                }
                let index = s.append_window(window);
                if fraud {
                    s.flag_fraud();
                }
                Ok((index, fraud))
            })
            .await?;

        if fraud_detected {
            warn!(
                session_id = %session.session_id,
                window_index,
                "fraud verdict raised, session frozen and moved under review"
            );
            self.dispatch_event(
                &session,
                SessionEvent::FraudFlagged {
                    session_id: session.session_id.clone(),
                },
            )
            .await;
        }

        analysis.fraud_detected = fraud_detected;
        analysis.lecture_quality = Some(monitor::derive_lecture_quality(&analysis));

        Ok(MonitorOutcome {
            analysis,
            window_index,
            session_status: session.status,
            token_status: session.token_status,
        })
    }

    //-------------------------------------------------------------------------------------
    // Finalization
    //-------------------------------------------------------------------------------------

    /// Ends a live session: tears down the room (best effort), aggregates the
    /// monitoring history, computes the duration and settles the fee when the
    /// session was never flagged.
    ///
    /// `actor` is `None` for internal callers (the abandonment sweep).
    pub async fn finalize(
        &self,
        session_id: &str,
        actor: Option<Uuid>,
        trigger: EndTrigger,
    ) -> PortResult<SessionSummary> {
        let session = self.store.fetch_session(session_id).await?;
        if let Some(user) = actor {
            if !session.is_participant(user) {
                return Err(PortError::Forbidden(
                    "you are not part of this session".to_string(),
                ));
            }
        }
        if session.status.is_terminal() {
            return match trigger {
                EndTrigger::Explicit => Err(PortError::InvalidState(
                    "session already ended".to_string(),
                )),
                EndTrigger::Disconnect => Ok(Self::summary_of(&session)),
            };
        }
        if session.status != SessionStatus::Live {
            return Err(PortError::InvalidState("session is not live".to_string()));
        }

        if let Err(e) = self.rooms.delete_room(&session.room_name).await {
            warn!(
                session_id = %session.session_id,
                error = %e,
                "room teardown failed; continuing finalization"
            );
        }

        // A session that ended before any monitoring interval elapsed still
        // gets baseline scores from one neutral oracle call.
        let fallback = if session.ai_windows.is_empty() {
            Some(
                self.oracle
                    .analyze_snapshot(
                        &neutral_snapshot(),
                        &session.skill,
                        &session.skill_category,
                    )
                    .await,
            )
        } else {
            None
        };

        // Phase one: claim the Live -> terminal transition. Whoever wins this
        // write is the only caller allowed to settle, which closes the
        // double-settlement race between concurrent finalize calls.
        let claim = self
            .mutate_session(session_id, |s| {
                if s.status != SessionStatus::Live {
                    return Err(PortError::InvalidState(
                        "session already ended".to_string(),
                    ));
                }
                if let Some(means) = s.mean_scores() {
                    s.final_engagement_score = Some(means.engagement);
                    s.final_teaching_score = Some(means.teaching);
                    s.final_participation_score = Some(means.participation);
                } else if let Some(baseline) = &fallback {
                    s.final_engagement_score = Some(baseline.engagement_score);
                    s.final_teaching_score = Some(baseline.teaching_score);
                    s.final_participation_score = Some(baseline.participation_score);
                }
                let now = Utc::now();
                if let Some(start) = s.start_time {
                    s.duration_minutes = Some(((now - start).num_seconds() / 60).max(0));
                }
                s.end_time = Some(now);
                s.status = if s.fraud_flagged || s.token_status == TokenStatus::Frozen {
                    SessionStatus::UnderReview
                } else {
                    SessionStatus::Completed
                };
                Ok(())
            })
            .await;

        let mut session = match claim {
            Ok((session, ())) => session,
            Err(PortError::InvalidState(_)) if trigger == EndTrigger::Disconnect => {
                // Lost to a concurrent finalize; already handled.
                let current = self.store.fetch_session(session_id).await?;
                return Ok(Self::summary_of(&current));
            }
            Err(e) => return Err(e),
        };

        // Phase two: settlement. Insufficient balance is a normal unmet
        // condition, and a ledger outage must not undo the ended session.
        if session.status == SessionStatus::Completed
            && !session.fraud_flagged
            && session.token_status == TokenStatus::Pending
        {
            let fee = self.config.session_fee_tokens;
            match self
                .ledger
                .settle(
                    session.learner,
                    session.teacher,
                    fee,
                    self.config.reputation_increment,
                )
                .await
            {
                Ok(true) => {
                    // Tokens have moved, so losing the record update would
                    // leave the ledger and the session disagreeing forever.
                    // The record write gets its own retry budget and a
                    // failure is logged loudly instead of failing the call.
                    let mut recorded = None;
                    for attempt in 0..MAX_SAVE_ATTEMPTS {
                        match self
                            .mutate_session(session_id, |s| {
                                s.tokens_transferred = true;
                                s.tokens_amount = Some(fee);
                                s.token_status = TokenStatus::Distributed;
                                Ok(())
                            })
                            .await
                        {
                            Ok((updated, ())) => {
                                recorded = Some(updated);
                                break;
                            }
                            Err(e) if attempt + 1 < MAX_SAVE_ATTEMPTS => {
                                warn!(
                                    session_id = %session.session_id,
                                    error = %e,
                                    "settlement record save failed, retrying"
                                );
                            }
                            Err(e) => {
                                error!(
                                    session_id = %session.session_id,
                                    error = %e,
                                    fee,
                                    "tokens settled but the session record was not \
                                     updated, token_status left pending"
                                );
                            }
                        }
                    }
                    if let Some(updated) = recorded {
                        session = updated;
                    }
                }
                Ok(false) => {
                    info!(
                        session_id = %session.session_id,
                        fee,
                        "learner balance insufficient, settlement deferred"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "settlement failed, fee left pending"
                    );
                }
            }
        }

        self.dispatch_event(
            &session,
            SessionEvent::SessionEnded {
                session_id: session.session_id.clone(),
                status: session.status.as_str().to_string(),
            },
        )
        .await;

        info!(
            session_id = %session.session_id,
            status = session.status.as_str(),
            duration_minutes = ?session.duration_minutes,
            tokens_transferred = session.tokens_transferred,
            "session finalized"
        );
        Ok(Self::summary_of(&session))
    }

    /// Explicit cancellation of a session that never went live.
    pub async fn cancel(&self, session_id: &str, actor: Uuid) -> PortResult<Session> {
        let (session, ()) = self
            .mutate_session(session_id, |s| {
                if !s.is_participant(actor) {
                    return Err(PortError::Forbidden(
                        "you are not part of this session".to_string(),
                    ));
                }
                if s.status != SessionStatus::Created {
                    return Err(PortError::InvalidState(
                        "only a created session can be cancelled".to_string(),
                    ));
                }
                s.status = SessionStatus::Cancelled;
                Ok(())
            })
            .await?;

        if let Err(e) = self.rooms.delete_room(&session.room_name).await {
            warn!(session_id = %session.session_id, error = %e, "failed to delete room");
        }
        info!(session_id = %session.session_id, "session cancelled");
        Ok(session)
    }

    //-------------------------------------------------------------------------------------
    // Queries and housekeeping
    //-------------------------------------------------------------------------------------

    /// Fetches a session for a participant, with a best-effort room access
    /// token (empty when the provider cannot issue one).
    pub async fn session_for(&self, session_id: &str, actor: Uuid) -> PortResult<(Session, String)> {
        let session = self.store.fetch_session(session_id).await?;
        if !session.is_participant(actor) {
            return Err(PortError::Forbidden(
                "you are not part of this session".to_string(),
            ));
        }
        let token = match self
            .rooms
            .issue_access_token(&session.room_name, actor, session.teacher == actor)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "room token issuance failed");
                String::new()
            }
        };
        Ok((session, token))
    }

    pub async fn sessions_for_user(&self, user_id: Uuid) -> PortResult<Vec<Session>> {
        self.store.find_sessions_for_user(user_id).await
    }

    /// Finalizes live sessions abandoned past `max_age` without an explicit
    /// end from either participant. Uses the automatic trigger semantics, so
    /// racing with a late explicit end is harmless.
    pub async fn sweep_abandoned(&self, max_age: Duration) -> PortResult<usize> {
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let stale = self.store.find_stale_live_sessions(cutoff).await?;
        let mut swept = 0;
        for session in stale {
            match self
                .finalize(&session.session_id, None, EndTrigger::Disconnect)
                .await
            {
                Ok(_) => swept += 1,
                Err(e) => warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "failed to sweep abandoned session"
                ),
            }
        }
        if swept > 0 {
            info!(swept, "abandoned live sessions finalized");
        }
        Ok(swept)
    }

    //-------------------------------------------------------------------------------------
    // Internals
    //-------------------------------------------------------------------------------------

    /// Optimistic read-modify-write with bounded retries on stale-revision
    /// conflicts. `apply` must be pure with respect to the session passed in:
    /// it may run more than once.
    async fn mutate_session<T, F>(&self, session_id: &str, mut apply: F) -> PortResult<(Session, T)>
    where
        F: FnMut(&mut Session) -> PortResult<T> + Send,
    {
        let mut attempts = 0;
        loop {
            let mut session = self.store.fetch_session(session_id).await?;
            let value = apply(&mut session)?;
            match self.store.save_session(&session).await {
                Ok(saved) => return Ok((saved, value)),
                Err(PortError::Conflict(_)) if attempts + 1 < MAX_SAVE_ATTEMPTS => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_event(&self, session: &Session, event: SessionEvent) {
        for user in [session.teacher, session.learner] {
            if let Err(e) = self.notifier.notify(user, event.clone()).await {
                warn!(
                    session_id = %session.session_id,
                    user = %user,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
    }

    fn summary_of(session: &Session) -> SessionSummary {
        SessionSummary {
            session_id: session.session_id.clone(),
            status: session.status,
            duration_minutes: session.duration_minutes,
            final_engagement_score: session.final_engagement_score,
            final_teaching_score: session.final_teaching_score,
            final_participation_score: session.final_participation_score,
            tokens_transferred: session.tokens_transferred,
            token_status: session.token_status,
        }
    }
}

/// The snapshot used for the zero-window baseline analysis: both parties
/// nominally present and speaking.
fn neutral_snapshot() -> MonitoringSnapshot {
    let present = ParticipantActivity {
        speaking: true,
        camera_on: true,
        silence_duration: None,
    };
    MonitoringSnapshot {
        transcript: None,
        speaker_activity: Some(SpeakerActivity {
            teacher: present.clone(),
            learner: present,
        }),
        interaction_metrics: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InteractionMetrics, LectureQuality};
    use crate::test_support::{
        seeded_match, FailingNotifier, FailingRooms, MemoryLedger, MemoryStore,
        RecordingNotifier, StubOracle, UrlRooms,
    };

    fn engine_with(
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        oracle: Arc<StubOracle>,
    ) -> SessionEngine {
        SessionEngine::new(
            store,
            ledger,
            oracle,
            Arc::new(UrlRooms::default()),
            Arc::new(RecordingNotifier::default()),
            EngineConfig::default(),
        )
    }

    fn scored(e: f64, t: f64, p: f64) -> AnalysisResult {
        AnalysisResult {
            engagement_score: e,
            teaching_score: t,
            participation_score: p,
            fraud_detected: false,
            notes: "solid two-way exchange".to_string(),
            recommendations: Vec::new(),
            lecture_quality: None,
            key_strengths: Vec::new(),
            improvement_areas: Vec::new(),
        }
    }

    /// A benign snapshot: both speaking, metrics show two-way interaction.
    fn active_snapshot() -> MonitoringSnapshot {
        let speaking = ParticipantActivity {
            speaking: true,
            camera_on: true,
            silence_duration: Some(2),
        };
        MonitoringSnapshot {
            transcript: Some("teacher explains, learner asks a question?".to_string()),
            speaker_activity: Some(SpeakerActivity {
                teacher: speaking.clone(),
                learner: speaking,
            }),
            interaction_metrics: Some(InteractionMetrics {
                teacher_speaking_time: 100,
                learner_speaking_time: 40,
                question_count: 2,
                has_two_way_interaction: true,
            }),
        }
    }

    /// A snapshot that trips the mutual-silence heuristic.
    fn silent_snapshot() -> MonitoringSnapshot {
        let silent = ParticipantActivity {
            speaking: false,
            camera_on: true,
            silence_duration: Some(200),
        };
        MonitoringSnapshot {
            transcript: Some(String::new()),
            speaker_activity: Some(SpeakerActivity {
                teacher: silent.clone(),
                learner: silent,
            }),
            interaction_metrics: None,
        }
    }

    async fn live_session(
        engine: &SessionEngine,
        store: &MemoryStore,
    ) -> (String, Uuid, Uuid) {
        let pairing = seeded_match(store);
        let session = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();
        engine
            .mark_ready(&session.session_id, pairing.teacher)
            .await
            .unwrap();
        engine
            .mark_ready(&session.session_id, pairing.learner)
            .await
            .unwrap();
        (session.session_id, pairing.teacher, pairing.learner)
    }

    #[tokio::test]
    async fn happy_path_full_lifecycle() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(70.0, 80.0, 60.0));
        oracle.push(scored(75.0, 82.0, 65.0));
        oracle.push(scored(72.0, 81.0, 63.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);
        ledger.credit(teacher, 5);

        let live = store.fetch_session(&session_id).await.unwrap();
        assert_eq!(live.status, SessionStatus::Live);
        assert!(live.start_time.is_some());

        for i in 0..3 {
            let outcome = engine
                .ingest_snapshot(&session_id, if i % 2 == 0 { teacher } else { learner }, active_snapshot())
                .await
                .unwrap();
            assert_eq!(outcome.window_index, i);
            assert!(!outcome.analysis.fraud_detected);
            assert_eq!(outcome.session_status, SessionStatus::Live);
        }

        let summary = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert!((summary.final_engagement_score.unwrap() - 72.333333).abs() < 1e-4);
        assert!((summary.final_teaching_score.unwrap() - 81.0).abs() < 1e-9);
        assert!((summary.final_participation_score.unwrap() - 62.666666).abs() < 1e-4);
        assert!(summary.tokens_transferred);
        assert_eq!(summary.token_status, TokenStatus::Distributed);
        assert_eq!(summary.duration_minutes, Some(0));

        assert_eq!(ledger.balance(learner), 40);
        assert_eq!(ledger.balance(teacher), 15);
        assert_eq!(ledger.reputation(teacher), 1);

        // Window indexes are gapless in append order.
        let stored = store.fetch_session(&session_id).await.unwrap();
        let indexes: Vec<usize> = stored.ai_windows.iter().map(|w| w.window_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn ready_handshake_is_monotonic_and_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        let session = engine
            .create_session(pairing.id, pairing.learner)
            .await
            .unwrap();

        // Duplicate ready calls from the same side are no-ops.
        engine
            .mark_ready(&session.session_id, pairing.teacher)
            .await
            .unwrap();
        let after_dup = engine
            .mark_ready(&session.session_id, pairing.teacher)
            .await
            .unwrap();
        assert_eq!(after_dup.status, SessionStatus::Created);
        assert!(after_dup.start_time.is_none());

        let live = engine
            .mark_ready(&session.session_id, pairing.learner)
            .await
            .unwrap();
        assert_eq!(live.status, SessionStatus::Live);
        let started_at = live.start_time.unwrap();

        // Further ready calls never restamp the start time.
        let again = engine
            .mark_ready(&session.session_id, pairing.learner)
            .await
            .unwrap();
        assert_eq!(again.status, SessionStatus::Live);
        assert_eq!(again.start_time.unwrap(), started_at);
    }

    #[tokio::test]
    async fn ingest_rejects_non_live_sessions() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        let session = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();

        let err = engine
            .ingest_snapshot(&session.session_id, pairing.teacher, active_snapshot())
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));
    }

    #[tokio::test]
    async fn fraud_mid_session_freezes_and_ratchets() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(70.0, 80.0, 60.0));
        oracle.push(scored(20.0, 20.0, 20.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 100);

        engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap();

        let flagged = engine
            .ingest_snapshot(&session_id, learner, silent_snapshot())
            .await
            .unwrap();
        assert!(flagged.analysis.fraud_detected);
        assert_eq!(flagged.session_status, SessionStatus::UnderReview);
        assert_eq!(flagged.token_status, TokenStatus::Frozen);

        // A stale monitoring call must not mutate the frozen session.
        let err = engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));

        // An explicit end after the freeze surfaces the conflict.
        let err = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));

        // The ratchet holds and no tokens ever move.
        let stored = store.fetch_session(&session_id).await.unwrap();
        assert!(stored.fraud_flagged);
        assert_eq!(stored.status, SessionStatus::UnderReview);
        assert_eq!(stored.token_status, TokenStatus::Frozen);
        assert!(!stored.tokens_transferred);
        assert_eq!(ledger.balance(learner), 100);
    }

    #[tokio::test]
    async fn oracle_fraud_verdict_is_ored_with_heuristics() {
        let store = Arc::new(MemoryStore::default());
        let oracle = Arc::new(StubOracle::default());
        let mut suspicious = scored(30.0, 30.0, 30.0);
        suspicious.fraud_detected = true;
        oracle.push(suspicious);
        let engine = engine_with(store.clone(), Arc::new(MemoryLedger::default()), oracle);

        let (session_id, teacher, _) = live_session(&engine, &store).await;

        // The snapshot itself is benign; the oracle's verdict alone flags it.
        let outcome = engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap();
        assert!(outcome.analysis.fraud_detected);
        assert_eq!(outcome.session_status, SessionStatus::UnderReview);
    }

    #[tokio::test]
    async fn lecture_quality_is_derived_when_oracle_omits_it() {
        let store = Arc::new(MemoryStore::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(90.0, 85.0, 88.0));
        let engine = engine_with(store.clone(), Arc::new(MemoryLedger::default()), oracle);

        let (session_id, teacher, _) = live_session(&engine, &store).await;
        let outcome = engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap();
        assert_eq!(
            outcome.analysis.lecture_quality,
            Some(LectureQuality::Excellent)
        );
    }

    #[tokio::test]
    async fn zero_window_finalize_uses_baseline_scores() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(55.0, 65.0, 45.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle.clone());

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 20);

        let summary = engine
            .finalize(&session_id, Some(learner), EndTrigger::Explicit)
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.final_engagement_score, Some(55.0));
        assert_eq!(summary.final_teaching_score, Some(65.0));
        assert_eq!(summary.final_participation_score, Some(45.0));
        assert!(summary.duration_minutes.is_some());
        assert_eq!(oracle.calls(), 1);
        assert_eq!(ledger.balance(teacher), 10);
    }

    #[tokio::test]
    async fn insufficient_balance_defers_settlement() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(70.0, 70.0, 70.0));
        oracle.push(scored(70.0, 70.0, 70.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 5);

        engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap();
        let summary = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();

        // Not an error: the session completes with the fee left pending.
        assert_eq!(summary.status, SessionStatus::Completed);
        assert!(!summary.tokens_transferred);
        assert_eq!(summary.token_status, TokenStatus::Pending);
        assert_eq!(ledger.balance(learner), 5);
        assert_eq!(ledger.balance(teacher), 0);
        assert_eq!(ledger.reputation(teacher), 0);
    }

    #[tokio::test]
    async fn duplicate_active_session_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();

        // Same triple again, from the other party.
        let second = seeded_match_like(&store, &pairing);
        let err = engine
            .create_session(second.id, second.learner)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));
    }

    /// Seeds another pending match with the same pair and skill.
    fn seeded_match_like(store: &MemoryStore, like: &Match) -> Match {
        let cloned = Match {
            id: Uuid::new_v4(),
            ..like.clone()
        };
        store.put_match(cloned.clone());
        cloned
    }

    #[tokio::test]
    async fn match_transitions_to_accepted_exactly_once() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        assert_eq!(pairing.status, MatchStatus::Pending);

        engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();
        let accepted = store.get_match(pairing.id).await.unwrap();
        assert_eq!(accepted.status, MatchStatus::Accepted);
    }

    #[tokio::test]
    async fn rejected_match_cannot_produce_a_session() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let mut pairing = seeded_match(&store);
        pairing.status = MatchStatus::Rejected;
        store.put_match(pairing.clone());

        let err = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));
    }

    #[tokio::test]
    async fn outsiders_are_forbidden() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let (session_id, _, _) = live_session(&engine, &store).await;
        let outsider = Uuid::new_v4();

        assert!(matches!(
            engine.mark_ready(&session_id, outsider).await.unwrap_err(),
            PortError::Forbidden(_)
        ));
        assert!(matches!(
            engine
                .ingest_snapshot(&session_id, outsider, active_snapshot())
                .await
                .unwrap_err(),
            PortError::Forbidden(_)
        ));
        assert!(matches!(
            engine
                .finalize(&session_id, Some(outsider), EndTrigger::Explicit)
                .await
                .unwrap_err(),
            PortError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn explicit_end_of_terminal_session_conflicts_but_disconnect_is_tolerated() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(60.0, 60.0, 60.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);

        let first = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();
        assert_eq!(first.status, SessionStatus::Completed);

        let err = engine
            .finalize(&session_id, Some(learner), EndTrigger::Explicit)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));

        // A detected-disconnect trigger is already satisfied, not a failure,
        // and never settles twice.
        let again = engine
            .finalize(&session_id, Some(learner), EndTrigger::Disconnect)
            .await
            .unwrap();
        assert_eq!(again.status, SessionStatus::Completed);
        assert_eq!(ledger.balance(teacher), 10);
    }

    #[tokio::test]
    async fn cancel_only_from_created() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        let session = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();

        let cancelled = engine
            .cancel(&session.session_id, pairing.learner)
            .await
            .unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        // Live sessions end through finalize, not cancel.
        let (live_id, teacher, _) = live_session(&engine, &store).await;
        let err = engine.cancel(&live_id, teacher).await.unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stale_revision_conflicts_are_retried() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        let session = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();

        store.inject_conflicts(1);
        let updated = engine
            .mark_ready(&session.session_id, pairing.teacher)
            .await
            .unwrap();
        assert!(updated.ready.teacher);
    }

    #[tokio::test]
    async fn room_teardown_failure_does_not_abort_finalize() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(50.0, 50.0, 50.0));
        let engine = SessionEngine::new(
            store.clone(),
            ledger.clone(),
            oracle,
            Arc::new(FailingRooms::teardown_only()),
            Arc::new(RecordingNotifier::default()),
            EngineConfig::default(),
        );

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);

        let summary = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert!(summary.tokens_transferred);
    }

    #[tokio::test]
    async fn room_creation_failure_escalates() {
        let store = Arc::new(MemoryStore::default());
        let engine = SessionEngine::new(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
            Arc::new(FailingRooms::create_too()),
            Arc::new(RecordingNotifier::default()),
            EngineConfig::default(),
        );
        let pairing = seeded_match(&store);
        let err = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Unavailable(_)));
    }

    #[tokio::test]
    async fn notification_failures_never_abort_the_operation() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(40.0, 40.0, 40.0));
        let engine = SessionEngine::new(
            store.clone(),
            ledger.clone(),
            oracle,
            Arc::new(UrlRooms::default()),
            Arc::new(FailingNotifier),
            EngineConfig::default(),
        );

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);
        let summary = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn fraud_and_end_events_reach_both_participants() {
        let store = Arc::new(MemoryStore::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(30.0, 30.0, 30.0));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = SessionEngine::new(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            oracle,
            Arc::new(UrlRooms::default()),
            notifier.clone(),
            EngineConfig::default(),
        );

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        let outcome = engine
            .ingest_snapshot(&session_id, teacher, silent_snapshot())
            .await
            .unwrap();
        assert!(outcome.analysis.fraud_detected);

        let flagged: Vec<Uuid> = notifier
            .events()
            .into_iter()
            .filter(|(_, event)| matches!(event, SessionEvent::FraudFlagged { .. }))
            .map(|(user, _)| user)
            .collect();
        assert!(flagged.contains(&teacher));
        assert!(flagged.contains(&learner));
    }

    #[tokio::test]
    async fn sweep_finalizes_abandoned_live_sessions_once() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(50.0, 50.0, 50.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, _, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);
        store.backdate_start(&session_id, Duration::hours(7));

        let swept = engine.sweep_abandoned(Duration::hours(4)).await.unwrap();
        assert_eq!(swept, 1);
        let stored = store.fetch_session(&session_id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);

        // Already terminal: nothing left to sweep.
        let swept = engine.sweep_abandoned(Duration::hours(4)).await.unwrap();
        assert_eq!(swept, 0);
    }

    #[tokio::test]
    async fn ready_is_rejected_once_the_session_has_ended() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine_with(
            store.clone(),
            Arc::new(MemoryLedger::default()),
            Arc::new(StubOracle::default()),
        );
        let pairing = seeded_match(&store);
        let session = engine
            .create_session(pairing.id, pairing.teacher)
            .await
            .unwrap();
        engine
            .cancel(&session.session_id, pairing.teacher)
            .await
            .unwrap();

        let err = engine
            .mark_ready(&session.session_id, pairing.learner)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidState(_)));

        // The terminal session was not touched.
        let stored = store.fetch_session(&session.session_id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
        assert!(!stored.ready.teacher);
        assert!(!stored.ready.learner);
    }

    #[tokio::test]
    async fn rate_limiter_is_fixed_window_and_bounded_per_key() {
        let store = MemoryStore::default();

        assert!(store.check_rate_limit("monitor:a", 2, 3600).await.unwrap());
        assert!(store.check_rate_limit("monitor:a", 2, 3600).await.unwrap());
        assert!(!store.check_rate_limit("monitor:a", 2, 3600).await.unwrap());

        // Keys count independently, and repeated checks never grow the
        // stored state past one window per key.
        assert!(store.check_rate_limit("monitor:b", 2, 3600).await.unwrap());
        assert_eq!(store.rate_rows(), 2);
    }

    #[tokio::test]
    async fn settled_tokens_survive_a_lost_record_update() {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let oracle = Arc::new(StubOracle::default());
        oracle.push(scored(70.0, 70.0, 70.0));
        let engine = engine_with(store.clone(), ledger.clone(), oracle);

        let (session_id, teacher, learner) = live_session(&engine, &store).await;
        ledger.credit(learner, 50);
        engine
            .ingest_snapshot(&session_id, teacher, active_snapshot())
            .await
            .unwrap();

        // Every save that would record the distribution now fails, as if
        // the store went down right after the ledger committed.
        store.reject_settlement_records();
        let summary = engine
            .finalize(&session_id, Some(teacher), EndTrigger::Explicit)
            .await
            .unwrap();

        // The call still succeeds and the ledger movement is kept; only the
        // session record is left behind, flagged in the logs.
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(ledger.balance(learner), 40);
        assert_eq!(ledger.balance(teacher), 10);
        assert_eq!(ledger.reputation(teacher), 1);
        let stored = store.fetch_session(&session_id).await.unwrap();
        assert_eq!(stored.token_status, TokenStatus::Pending);
        assert!(!stored.tokens_transferred);
    }
}
