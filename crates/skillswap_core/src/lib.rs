pub mod domain;
pub mod engine;
pub mod fraud;
pub mod monitor;
pub mod ports;

#[cfg(test)]
pub(crate) mod test_support;

pub use domain::{
    AiWindow, AnalysisResult, AuthSession, InteractionMetrics, LectureQuality, Match, MatchStatus,
    MonitoringSnapshot, ParticipantActivity, ReadyStatus, Session, SessionRole, SessionStatus,
    SpeakerActivity, TokenStatus, User, UserCredentials, VideoRoom,
};
pub use engine::{EndTrigger, EngineConfig, MonitorOutcome, SessionEngine, SessionSummary};
pub use ports::{
    NotificationService, PortError, PortResult, SessionAnalysisService, SessionEvent,
    SessionStore, TokenLedger, VideoRoomService,
};
