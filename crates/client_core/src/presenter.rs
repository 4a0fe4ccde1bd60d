use shared::{
    domain::{SegmentPhase, UserId},
    protocol::{ParticipantSummary, PresenterAssignment},
};
use thiserror::Error;
use tracing::info;

/// Local rejections are optimistic UX only; the server re-checks every
/// one of these and remains the enforcement authority.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenterError {
    #[error("only the host may select a presenter")]
    NotHost,
    #[error("presenter target user {0} is not online")]
    TargetOffline(i64),
    #[error("cannot hand the presenter role to yourself")]
    SelfHandOff,
    #[error("only the current presenter may hand off the role")]
    NotPresenter,
    #[error("only the selected presenter may start the presentation")]
    NotSelected,
    #[error("presentation cannot start from the {0:?} phase")]
    WrongPhase(SegmentPhase),
}

#[derive(Debug, Clone, Default)]
pub struct PresenterState {
    assignment: Option<PresenterAssignment>,
    paused: bool,
}

impl PresenterState {
    pub fn from_assignment(assignment: Option<PresenterAssignment>) -> Self {
        Self {
            assignment,
            paused: false,
        }
    }

    pub fn assignment(&self) -> Option<&PresenterAssignment> {
        self.assignment.as_ref()
    }

    pub fn current_presenter(&self) -> Option<UserId> {
        self.assignment.as_ref().map(|a| a.presenter_id)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn validate_select(
        &self,
        is_host: bool,
        target: UserId,
        roster: &[ParticipantSummary],
    ) -> Result<(), PresenterError> {
        if !is_host {
            return Err(PresenterError::NotHost);
        }
        let online = roster.iter().any(|p| p.user_id == target && p.online);
        if !online {
            return Err(PresenterError::TargetOffline(target.0));
        }
        Ok(())
    }

    pub fn validate_pass(&self, caller: UserId, next: UserId) -> Result<(), PresenterError> {
        if next == caller {
            return Err(PresenterError::SelfHandOff);
        }
        match self.current_presenter() {
            Some(current) if current == caller => Ok(()),
            _ => Err(PresenterError::NotPresenter),
        }
    }

    pub fn validate_start(
        &self,
        caller: UserId,
        phase: SegmentPhase,
    ) -> Result<(), PresenterError> {
        match self.current_presenter() {
            Some(current) if current == caller => {}
            _ => return Err(PresenterError::NotSelected),
        }
        if phase != SegmentPhase::Waiting {
            return Err(PresenterError::WrongPhase(phase));
        }
        Ok(())
    }

    /// Fresh presenter-bearing message; also an implicit resume.
    pub fn apply_assignment(&mut self, assignment: PresenterAssignment) {
        info!(
            presenter_id = assignment.presenter_id.0,
            presenter_name = %assignment.presenter_name,
            "presenter assigned"
        );
        self.assignment = Some(assignment);
        self.paused = false;
    }

    /// Returns true when the pause actually changed state.
    pub fn apply_pause(&mut self) -> bool {
        if self.assignment.is_none() || self.paused {
            return false;
        }
        self.paused = true;
        true
    }

    pub fn apply_resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        true
    }

    pub fn clear(&mut self) {
        self.assignment = None;
        self.paused = false;
    }
}
