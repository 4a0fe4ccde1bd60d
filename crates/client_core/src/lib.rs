use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{EntityKind, EventId, SegmentId, SegmentPhase, UserId},
    protocol::{
        ClientMessage, EntitySnapshot, LeaderboardEntry, ParticipantSummary,
        PresenterAssignment, QuestionPayload, ServerMessage, SessionSnapshot,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod leaderboard;
pub mod phase;
pub mod presenter;
pub mod reconnect;
pub mod resume;
pub mod retry;
pub mod transport;
pub mod upload;

use leaderboard::compute_ranking;
use phase::{PhaseMachine, PhaseUpdate};
use presenter::PresenterState;
use reconnect::{ReconnectAction, ReconnectPolicy, ReconnectStatus, Reconnector};
use transport::{MissingTransport, SessionTransport, TransportEvent};

/// Produces a fresh live connection for the reconnect path. The server
/// answers every (re)connect with a full-sync `connected` message, so a
/// successful factory call is all recovery needs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SessionTransport>>;
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionReset(SessionSnapshot),
    PhaseChanged {
        segment_id: SegmentId,
        phase: SegmentPhase,
    },
    QuestionReceived(QuestionPayload),
    LeaderboardUpdated(Vec<LeaderboardEntry>),
    PresenterChanged(Option<PresenterAssignment>),
    PresenterPaused {
        segment_id: SegmentId,
    },
    PresenterResumed {
        segment_id: SegmentId,
    },
    AnswersOpenChanged(bool),
    SegmentComplete {
        segment_id: SegmentId,
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
    ConnectionLost,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionTimer {
    pub remaining: Duration,
    pub frozen: bool,
}

#[derive(Default)]
struct SessionState {
    event_id: Option<EventId>,
    machine: Option<PhaseMachine>,
    presenter: PresenterState,
    roster: Vec<ParticipantSummary>,
    current_question: Option<QuestionPayload>,
    question_timer: Option<QuestionTimer>,
    leaderboard: Vec<LeaderboardEntry>,
    answers_open: bool,
}

/// One client's view of a live quiz session. All state mutation happens
/// inside the single dispatch loop, so observers converge on whatever
/// the latest authoritative message said.
pub struct SessionClient {
    http: Client,
    server_url: String,
    local_user: UserId,
    is_host: bool,
    transport: Mutex<Arc<dyn SessionTransport>>,
    factory: Mutex<Option<Arc<dyn TransportFactory>>>,
    reconnector: Reconnector,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionClient {
    pub fn new(server_url: impl Into<String>, local_user: UserId, is_host: bool) -> Arc<Self> {
        Self::new_with_reconnect_policy(server_url, local_user, is_host, ReconnectPolicy::default())
    }

    pub fn new_with_reconnect_policy(
        server_url: impl Into<String>,
        local_user: UserId,
        is_host: bool,
        reconnect_policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            local_user,
            is_host,
            transport: Mutex::new(Arc::new(MissingTransport)),
            factory: Mutex::new(None),
            reconnector: Reconnector::new(reconnect_policy),
            inner: Mutex::new(SessionState::default()),
            events,
            dispatch_task: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ReconnectStatus {
        self.reconnector.status()
    }

    pub fn subscribe_connection(&self) -> tokio::sync::watch::Receiver<ReconnectStatus> {
        self.reconnector.subscribe()
    }

    /// Initial snapshot, fetched over HTTP before the live connection
    /// opens.
    pub async fn fetch_entity(&self, kind: EntityKind, id: i64) -> Result<EntitySnapshot> {
        let snapshot: EntitySnapshot = self
            .http
            .get(format!(
                "{}/{}/{id}",
                self.server_url,
                kind.path_segment()
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot)
    }

    pub async fn fetch_session_snapshot(&self, event_id: EventId) -> Result<SessionSnapshot> {
        let snapshot: SessionSnapshot = self
            .http
            .get(format!("{}/events/{}/session", self.server_url, event_id.0))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot)
    }

    /// Registers the factory used to re-establish the connection after
    /// an involuntary close.
    pub async fn set_transport_factory(&self, factory: Arc<dyn TransportFactory>) {
        *self.factory.lock().await = Some(factory);
    }

    /// Takes ownership of a live transport and starts dispatching its
    /// messages. Replaces any previous dispatch loop.
    pub async fn attach(self: &Arc<Self>, transport: Arc<dyn SessionTransport>) {
        {
            let mut guard = self.transport.lock().await;
            *guard = Arc::clone(&transport);
        }
        let mut receiver = transport.subscribe();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(TransportEvent::Message(message)) => {
                        client.handle_server_message(message).await;
                    }
                    Ok(TransportEvent::Malformed(err)) => {
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("invalid server message: {err}")));
                    }
                    Ok(TransportEvent::Closed)
                    | Err(broadcast::error::RecvError::Closed) => {
                        client.handle_connection_closed().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatch loop lagged behind transport events");
                    }
                }
            }
        });
        let mut guard = self.dispatch_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    /// Explicit disconnect: cancels the reconnector and every pending
    /// timer, then discards session state. The dispatch task is joined
    /// before the reconnector stops; otherwise a close racing the
    /// detach could start a fresh reconnect worker after `stop`.
    pub async fn detach(&self) {
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.reconnector.stop().await;
        *self.transport.lock().await = Arc::new(MissingTransport);
        *self.inner.lock().await = SessionState::default();
    }

    pub async fn start_presentation(&self) -> Result<()> {
        let segment_id = {
            let inner = self.inner.lock().await;
            let machine = inner
                .machine
                .as_ref()
                .ok_or_else(|| anyhow!("no active session"))?;
            inner
                .presenter
                .validate_start(self.local_user, machine.phase())?;
            machine.segment_id()
        };
        self.send(ClientMessage::StartPresentation { segment_id })
            .await
    }

    /// Voluntary hand-off. Rejected locally before anything is sent when
    /// the target is the caller; the server enforces the same invariant.
    pub async fn pass_presenter(&self, next_presenter_id: UserId) -> Result<()> {
        let segment_id = {
            let inner = self.inner.lock().await;
            let machine = inner
                .machine
                .as_ref()
                .ok_or_else(|| anyhow!("no active session"))?;
            inner
                .presenter
                .validate_pass(self.local_user, next_presenter_id)?;
            machine.segment_id()
        };
        self.send(ClientMessage::PassPresenter {
            segment_id,
            next_presenter_id,
        })
        .await
    }

    /// Host-only selection; the online check against the roster is an
    /// advisory client check, the server is authoritative.
    pub async fn select_presenter(&self, presenter_id: UserId) -> Result<()> {
        let segment_id = {
            let inner = self.inner.lock().await;
            let machine = inner
                .machine
                .as_ref()
                .ok_or_else(|| anyhow!("no active session"))?;
            inner
                .presenter
                .validate_select(self.is_host, presenter_id, &inner.roster)?;
            machine.segment_id()
        };
        self.send(ClientMessage::SelectPresenter {
            segment_id,
            presenter_id,
        })
        .await
    }

    /// Opaque pass-through traffic (drawing strokes and similar).
    pub async fn send_channel(&self, channel: impl Into<String>, data: serde_json::Value) -> Result<()> {
        self.send(ClientMessage::Channel {
            channel: channel.into(),
            data,
        })
        .await
    }

    pub async fn phase(&self) -> Option<SegmentPhase> {
        self.inner.lock().await.machine.as_ref().map(|m| m.phase())
    }

    pub async fn segment_id(&self) -> Option<SegmentId> {
        self.inner
            .lock()
            .await
            .machine
            .as_ref()
            .map(|m| m.segment_id())
    }

    pub async fn answers_open(&self) -> bool {
        self.inner.lock().await.answers_open
    }

    pub async fn roster(&self) -> Vec<ParticipantSummary> {
        self.inner.lock().await.roster.clone()
    }

    pub async fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.inner.lock().await.leaderboard.clone()
    }

    pub async fn presenter(&self) -> Option<PresenterAssignment> {
        self.inner.lock().await.presenter.assignment().cloned()
    }

    pub async fn current_question(&self) -> Option<QuestionPayload> {
        self.inner.lock().await.current_question.clone()
    }

    pub async fn question_timer(&self) -> Option<QuestionTimer> {
        self.inner.lock().await.question_timer.clone()
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let transport = { Arc::clone(&*self.transport.lock().await) };
        transport.send(message).await
    }

    async fn handle_connection_closed(self: &Arc<Self>) {
        warn!("live connection closed");
        let _ = self.events.send(ClientEvent::ConnectionLost);
        let factory = { self.factory.lock().await.clone() };
        if let Some(factory) = factory {
            let action: Arc<dyn ReconnectAction> = Arc::new(ReattachAction {
                client: Arc::clone(self),
                factory,
            });
            self.reconnector.start(action).await;
        }
    }

    async fn handle_server_message(self: &Arc<Self>, message: ServerMessage) {
        let mut outgoing = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.apply(message, &mut outgoing);
        }
        for event in outgoing {
            let _ = self.events.send(event);
        }
    }
}

struct ReattachAction {
    client: Arc<SessionClient>,
    factory: Arc<dyn TransportFactory>,
}

#[async_trait]
impl ReconnectAction for ReattachAction {
    async fn attempt_reconnect(&self) -> Result<()> {
        let transport = self.factory.connect().await?;
        self.client.attach(transport).await;
        Ok(())
    }
}

impl SessionState {
    fn apply(&mut self, message: ServerMessage, out: &mut Vec<ClientEvent>) {
        match message {
            ServerMessage::Connected { snapshot } => self.apply_full_sync(snapshot, out),
            ServerMessage::Question {
                segment_id,
                phase_seq,
                question,
            } => self.apply_question(segment_id, phase_seq, question, out),
            ServerMessage::PhaseChanged {
                segment_id,
                phase_seq,
                phase,
                leaderboard,
            } => self.apply_phase_change(segment_id, phase_seq, phase, leaderboard, out),
            ServerMessage::PresenterSelected {
                segment_id,
                presenter,
            }
            | ServerMessage::PresenterChanged {
                segment_id,
                presenter,
            } => self.apply_presenter(segment_id, presenter, out),
            ServerMessage::PresenterPaused {
                segment_id,
                phase_seq,
            } => self.apply_presenter_paused(segment_id, phase_seq, out),
            ServerMessage::PresentationStarted {
                segment_id,
                phase_seq,
                presenter_id,
            } => {
                info!(
                    segment_id = segment_id.0,
                    presenter_id = presenter_id.0,
                    "presentation started"
                );
                self.apply_phase_message(segment_id, SegmentPhase::Recording, phase_seq, out);
            }
            ServerMessage::WaitingForPresenter {
                segment_id,
                phase_seq,
            } => {
                self.presenter.clear();
                out.push(ClientEvent::PresenterChanged(None));
                self.apply_phase_message(segment_id, SegmentPhase::Waiting, phase_seq, out);
            }
            ServerMessage::SegmentComplete {
                segment_id,
                phase_seq,
                next_segment_id,
            } => {
                self.apply_phase_message(
                    segment_id,
                    SegmentPhase::SegmentComplete,
                    phase_seq,
                    out,
                );
                self.current_question = None;
                self.question_timer = None;
                out.push(ClientEvent::SegmentComplete {
                    segment_id,
                    next_segment_id,
                });
            }
            ServerMessage::EventComplete { event_id } => {
                out.push(ClientEvent::EventComplete { event_id });
            }
            ServerMessage::MegaQuizReady { event_id } => {
                out.push(ClientEvent::MegaQuizReady { event_id });
            }
            ServerMessage::GameStarted { segment_id, game } => {
                out.push(ClientEvent::GameStarted { segment_id, game });
            }
            ServerMessage::Error(api_error) => {
                if api_error.code.is_transient() {
                    warn!("server reported a transient fault: {api_error}");
                }
                out.push(ClientEvent::Error(api_error.to_string()));
            }
        }
    }

    /// Full-sync: the whole derived view is replaced, never merged.
    fn apply_full_sync(&mut self, snapshot: SessionSnapshot, out: &mut Vec<ClientEvent>) {
        self.event_id = Some(snapshot.event_id);
        match self.machine.as_mut() {
            Some(machine) => machine.reset_from_sync(&snapshot),
            None => self.machine = Some(PhaseMachine::from_snapshot(&snapshot)),
        }
        self.roster = snapshot.roster.clone();
        self.presenter = PresenterState::from_assignment(snapshot.presenter.clone());
        self.current_question = snapshot.current_question.clone();
        self.question_timer = snapshot.current_question.as_ref().map(|q| QuestionTimer {
            remaining: Duration::from_millis(q.time_limit_ms),
            frozen: false,
        });
        self.leaderboard = compute_ranking(snapshot.leaderboard.clone());
        out.push(ClientEvent::SessionReset(snapshot));
        self.refresh_answers_open(out);
    }

    fn apply_question(
        &mut self,
        segment_id: SegmentId,
        phase_seq: u64,
        question: QuestionPayload,
        out: &mut Vec<ClientEvent>,
    ) {
        let Some(machine) = self.machine.as_mut() else {
            warn!("question message before any full-sync; dropping");
            return;
        };
        if machine.apply_phase(segment_id, SegmentPhase::ShowingQuestion, phase_seq)
            != PhaseUpdate::Applied
        {
            return;
        }
        self.question_timer = Some(QuestionTimer {
            remaining: Duration::from_millis(question.time_limit_ms),
            frozen: false,
        });
        self.current_question = Some(question.clone());
        out.push(ClientEvent::QuestionReceived(question));
        out.push(ClientEvent::PhaseChanged {
            segment_id,
            phase: SegmentPhase::ShowingQuestion,
        });
        self.refresh_answers_open(out);
    }

    fn apply_phase_change(
        &mut self,
        segment_id: SegmentId,
        phase_seq: u64,
        phase: SegmentPhase,
        leaderboard: Option<Vec<LeaderboardEntry>>,
        out: &mut Vec<ClientEvent>,
    ) {
        if !self.apply_phase_message(segment_id, phase, phase_seq, out) {
            return;
        }
        if let Some(entries) = leaderboard {
            self.leaderboard = compute_ranking(entries);
            out.push(ClientEvent::LeaderboardUpdated(self.leaderboard.clone()));
        }
    }

    fn apply_presenter(
        &mut self,
        segment_id: SegmentId,
        assignment: PresenterAssignment,
        out: &mut Vec<ClientEvent>,
    ) {
        self.presenter.apply_assignment(assignment.clone());
        // A fresh presenter-bearing message is an implicit resume.
        if let Some(machine) = self.machine.as_mut() {
            if machine.resume_presenter() == PhaseUpdate::Applied {
                out.push(ClientEvent::PresenterResumed { segment_id });
                if let Some(timer) = self.question_timer.as_mut() {
                    timer.frozen = false;
                }
            }
        }
        out.push(ClientEvent::PresenterChanged(Some(assignment)));
        self.refresh_answers_open(out);
    }

    fn apply_presenter_paused(
        &mut self,
        segment_id: SegmentId,
        phase_seq: u64,
        out: &mut Vec<ClientEvent>,
    ) {
        let Some(machine) = self.machine.as_mut() else {
            return;
        };
        if machine.pause_presenter(segment_id, phase_seq) != PhaseUpdate::Applied {
            return;
        }
        self.presenter.apply_pause();
        // Pause must freeze the question timer and close submissions.
        if let Some(timer) = self.question_timer.as_mut() {
            timer.frozen = true;
        }
        out.push(ClientEvent::PresenterPaused { segment_id });
        out.push(ClientEvent::PhaseChanged {
            segment_id,
            phase: SegmentPhase::PresenterPaused,
        });
        self.refresh_answers_open(out);
    }

    /// Returns true when the machine accepted the phase.
    fn apply_phase_message(
        &mut self,
        segment_id: SegmentId,
        phase: SegmentPhase,
        phase_seq: u64,
        out: &mut Vec<ClientEvent>,
    ) -> bool {
        let Some(machine) = self.machine.as_mut() else {
            warn!(
                segment_id = segment_id.0,
                "phase message before any full-sync; dropping"
            );
            return false;
        };
        if machine.apply_phase(segment_id, phase, phase_seq) != PhaseUpdate::Applied {
            return false;
        }
        out.push(ClientEvent::PhaseChanged { segment_id, phase });
        self.refresh_answers_open(out);
        true
    }

    fn refresh_answers_open(&mut self, out: &mut Vec<ClientEvent>) {
        let open = self
            .machine
            .as_ref()
            .map(|machine| {
                machine.phase() == SegmentPhase::ShowingQuestion
                    && self.current_question.is_some()
                    && !self.presenter.is_paused()
            })
            .unwrap_or(false);
        if open != self.answers_open {
            self.answers_open = open;
            out.push(ClientEvent::AnswersOpenChanged(open));
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
