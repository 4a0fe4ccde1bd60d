use shared::{
    domain::{SegmentId, SegmentPhase},
    protocol::SessionSnapshot,
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseUpdate {
    Applied,
    /// Older than (or equal to) the last applied seq for this segment,
    /// or addressed to a segment that already completed.
    Stale,
    /// Valid message that does not apply to the current state, e.g. a
    /// pause outside the quizzing sub-phases.
    Ignored,
}

/// Per-segment phase mirror driven entirely by phase-bearing protocol
/// messages. Never infers phase from side information; the latest
/// authoritative message wins, and a full-sync replaces everything.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    segment_id: SegmentId,
    phase: SegmentPhase,
    phase_seq: u64,
    resume_phase: Option<SegmentPhase>,
    /// Last segment whose terminal phase was applied. The seq window
    /// restarts per segment, so a late retransmit for a finished
    /// segment would otherwise look fresh.
    completed_segment: Option<SegmentId>,
}

impl PhaseMachine {
    pub fn new(segment_id: SegmentId, phase: SegmentPhase, phase_seq: u64) -> Self {
        Self {
            segment_id,
            phase,
            phase_seq,
            resume_phase: None,
            completed_segment: phase.is_terminal().then_some(segment_id),
        }
    }

    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self::new(snapshot.segment_id, snapshot.phase, snapshot.phase_seq)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn phase(&self) -> SegmentPhase {
        self.phase
    }

    pub fn phase_seq(&self) -> u64 {
        self.phase_seq
    }

    pub fn is_paused(&self) -> bool {
        self.phase == SegmentPhase::PresenterPaused
    }

    /// Full-sync reset; unconditional by design so a reconnect converges
    /// regardless of what was missed during the disconnect window.
    pub fn reset_from_sync(&mut self, snapshot: &SessionSnapshot) {
        self.segment_id = snapshot.segment_id;
        self.phase = snapshot.phase;
        self.phase_seq = snapshot.phase_seq;
        self.resume_phase = None;
        self.completed_segment = snapshot.phase.is_terminal().then_some(snapshot.segment_id);
    }

    pub fn apply_phase(
        &mut self,
        segment_id: SegmentId,
        phase: SegmentPhase,
        phase_seq: u64,
    ) -> PhaseUpdate {
        if self.completed_segment == Some(segment_id) {
            warn!(
                segment_id = segment_id.0,
                phase_seq, "dropping message for a completed segment"
            );
            return PhaseUpdate::Stale;
        }
        if segment_id == self.segment_id && phase_seq <= self.phase_seq {
            warn!(
                segment_id = segment_id.0,
                phase_seq,
                current_seq = self.phase_seq,
                "dropping stale phase message"
            );
            return PhaseUpdate::Stale;
        }
        if segment_id == self.segment_id && !transition_expected(self.phase, phase) {
            // Applied anyway: the server is authoritative, but an
            // unexpected jump usually means a missed message.
            warn!(
                segment_id = segment_id.0,
                from = ?self.phase,
                to = ?phase,
                "unexpected phase transition"
            );
        }
        if phase == SegmentPhase::PresenterPaused {
            if self.phase.is_quizzing() && segment_id == self.segment_id {
                self.resume_phase = Some(self.phase);
            }
        } else {
            self.resume_phase = None;
        }
        self.segment_id = segment_id;
        self.phase = phase;
        self.phase_seq = phase_seq;
        if phase.is_terminal() {
            self.completed_segment = Some(segment_id);
        }
        PhaseUpdate::Applied
    }

    /// Presenter-disconnect pause, applied only from a quizzing
    /// sub-phase. Remembers the sub-phase to return to.
    pub fn pause_presenter(&mut self, segment_id: SegmentId, phase_seq: u64) -> PhaseUpdate {
        if segment_id != self.segment_id || !self.phase.is_quizzing() {
            return PhaseUpdate::Ignored;
        }
        self.apply_phase(segment_id, SegmentPhase::PresenterPaused, phase_seq)
    }

    /// Implicit resume on a fresh presenter-bearing message. Returns to
    /// the sub-phase active when the pause hit.
    pub fn resume_presenter(&mut self) -> PhaseUpdate {
        if self.phase != SegmentPhase::PresenterPaused {
            return PhaseUpdate::Ignored;
        }
        self.phase = self.resume_phase.take().unwrap_or(SegmentPhase::Quizzing);
        PhaseUpdate::Applied
    }
}

/// The expected forward edges of the segment lifecycle. Anything else
/// is applied-but-logged; the machine trusts the latest message.
fn transition_expected(from: SegmentPhase, to: SegmentPhase) -> bool {
    use SegmentPhase::*;
    match (from, to) {
        (Waiting, Recording)
        | (Recording, Generating)
        | (Generating, QuizReady)
        | (QuizReady, Quizzing)
        | (Quizzing, ShowingQuestion)
        | (ShowingQuestion, RevealingAnswer)
        | (RevealingAnswer, ShowingQuestion)
        | (RevealingAnswer, Leaderboard)
        | (Leaderboard, ShowingQuestion)
        | (Leaderboard, SegmentComplete) => true,
        (from, PresenterPaused) => from.is_quizzing(),
        (PresenterPaused, to) => to.is_quizzing(),
        (from, to) => from == to,
    }
}
