use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::retry::backoff_delay;

/// One reconnect attempt against whatever transport the session uses.
/// Implementations must be safe to call repeatedly.
#[async_trait]
pub trait ReconnectAction: Send + Sync {
    async fn attempt_reconnect(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconnectStatus {
    pub reconnecting: bool,
    pub attempt_count: u32,
    pub next_attempt_in: Option<Duration>,
    pub given_up: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// No ceiling by default; the shell decides when to show "give up"
    /// UI from `attempt_count`.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Owns reconnect timing for one live connection. Attempts are strictly
/// sequential; `stop` joins on the aborted worker so a cancelled attempt
/// can never mutate status after teardown.
pub struct Reconnector {
    policy: ReconnectPolicy,
    status: watch::Sender<ReconnectStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ReconnectStatus::default());
        Self {
            policy,
            status,
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ReconnectStatus {
        self.status.borrow().clone()
    }

    pub async fn start(&self, action: Arc<dyn ReconnectAction>) {
        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.take() {
            previous.abort();
            let _ = previous.await;
        }
        self.status.send_replace(ReconnectStatus {
            reconnecting: true,
            ..ReconnectStatus::default()
        });
        let policy = self.policy;
        let status = self.status.clone();
        *worker = Some(tokio::spawn(async move {
            run_reconnect_loop(policy, status, action).await;
        }));
    }

    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.take() {
            previous.abort();
            let _ = previous.await;
        }
        self.status.send_replace(ReconnectStatus::default());
    }

    pub async fn reset(&self) {
        self.stop().await;
    }
}

async fn run_reconnect_loop(
    policy: ReconnectPolicy,
    status: watch::Sender<ReconnectStatus>,
    action: Arc<dyn ReconnectAction>,
) {
    let mut attempt_count = 0u32;
    if !policy.initial_delay.is_zero() {
        countdown(&status, attempt_count, policy.initial_delay).await;
    }
    loop {
        attempt_count += 1;
        status.send_replace(ReconnectStatus {
            reconnecting: true,
            attempt_count,
            next_attempt_in: None,
            given_up: false,
        });
        match action.attempt_reconnect().await {
            Ok(()) => {
                info!(attempt_count, "reconnect succeeded");
                status.send_replace(ReconnectStatus {
                    reconnecting: false,
                    attempt_count,
                    next_attempt_in: None,
                    given_up: false,
                });
                return;
            }
            Err(err) => {
                warn!(attempt_count, "reconnect attempt failed: {err}");
                if let Some(max) = policy.max_attempts {
                    if attempt_count >= max {
                        status.send_replace(ReconnectStatus {
                            reconnecting: false,
                            attempt_count,
                            next_attempt_in: None,
                            given_up: true,
                        });
                        return;
                    }
                }
                let delay = backoff_delay(attempt_count - 1, policy.base_delay, policy.max_delay);
                countdown(&status, attempt_count, delay).await;
            }
        }
    }
}

/// Publishes a live one-second countdown to the next attempt.
async fn countdown(status: &watch::Sender<ReconnectStatus>, attempt_count: u32, total: Duration) {
    let mut remaining = total;
    loop {
        status.send_replace(ReconnectStatus {
            reconnecting: true,
            attempt_count,
            next_attempt_in: Some(remaining),
            given_up: false,
        });
        if remaining.is_zero() {
            break;
        }
        let step = remaining.min(Duration::from_secs(1));
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}
