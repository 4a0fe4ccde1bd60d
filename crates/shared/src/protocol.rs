use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{EntityKind, EventId, QuestionId, SegmentId, SegmentPhase, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenterAssignment {
    pub presenter_id: UserId,
    pub presenter_name: String,
    pub is_first_presenter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
    #[serde(default)]
    pub is_late_joiner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: String,
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub is_late_joiner: bool,
    /// Dense positional rank, derived client-side; zero until ranked.
    #[serde(default)]
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub question_id: QuestionId,
    pub segment_id: SegmentId,
    pub index: u32,
    pub text: String,
    pub options: Vec<String>,
    pub time_limit_ms: u64,
    pub asked_at: DateTime<Utc>,
}

/// Authoritative snapshot sent on every (re)connect. Receivers replace
/// all derived session state with it, never merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub event_id: EventId,
    pub segment_id: SegmentId,
    pub phase: SegmentPhase,
    pub phase_seq: u64,
    pub roster: Vec<ParticipantSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presenter: Option<PresenterAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question: Option<QuestionPayload>,
    #[serde(default)]
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// REST view of a segment or event, as returned by the snapshot and
/// resume endpoints. A non-null `previous_status` marks an involuntary
/// termination awaiting an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub id: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        snapshot: SessionSnapshot,
    },
    Question {
        segment_id: SegmentId,
        phase_seq: u64,
        question: QuestionPayload,
    },
    PhaseChanged {
        segment_id: SegmentId,
        phase_seq: u64,
        phase: SegmentPhase,
        /// Standings accompany the transition into the leaderboard phase.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leaderboard: Option<Vec<LeaderboardEntry>>,
    },
    PresenterSelected {
        segment_id: SegmentId,
        presenter: PresenterAssignment,
    },
    PresenterChanged {
        segment_id: SegmentId,
        presenter: PresenterAssignment,
    },
    PresenterPaused {
        segment_id: SegmentId,
        phase_seq: u64,
    },
    PresentationStarted {
        segment_id: SegmentId,
        phase_seq: u64,
        presenter_id: UserId,
    },
    WaitingForPresenter {
        segment_id: SegmentId,
        phase_seq: u64,
    },
    SegmentComplete {
        segment_id: SegmentId,
        phase_seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_segment_id: Option<SegmentId>,
    },
    EventComplete {
        event_id: EventId,
    },
    MegaQuizReady {
        event_id: EventId,
    },
    GameStarted {
        segment_id: SegmentId,
        game: String,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    StartPresentation {
        segment_id: SegmentId,
    },
    SelectPresenter {
        segment_id: SegmentId,
        presenter_id: UserId,
    },
    PassPresenter {
        segment_id: SegmentId,
        next_presenter_id: UserId,
    },
    /// Opaque channel traffic (drawing strokes and similar) relayed for
    /// the shell without interpretation.
    Channel {
        channel: String,
        data: serde_json::Value,
    },
}
