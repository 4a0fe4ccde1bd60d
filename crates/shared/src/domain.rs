use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(EventId);
id_newtype!(SegmentId);
id_newtype!(QuestionId);
id_newtype!(UploadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Segment,
    Event,
}

impl EntityKind {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Segment => "segments",
            Self::Event => "events",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Participant,
}

/// Lifecycle phase of one presenter's segment. The client copy is a
/// mirror of the server's value and is fully replaced on full-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPhase {
    Waiting,
    Recording,
    Generating,
    QuizReady,
    Quizzing,
    ShowingQuestion,
    RevealingAnswer,
    Leaderboard,
    PresenterPaused,
    SegmentComplete,
}

impl SegmentPhase {
    /// Sub-phases of the live quiz that branch to `presenter_paused`
    /// when the presenter's connection drops.
    pub fn is_quizzing(self) -> bool {
        matches!(
            self,
            Self::Quizzing | Self::ShowingQuestion | Self::RevealingAnswer | Self::Leaderboard
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SegmentComplete)
    }
}
