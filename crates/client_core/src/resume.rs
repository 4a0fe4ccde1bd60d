use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use shared::{domain::EntityKind, protocol::EntitySnapshot};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Operator decision surface for an entity that carries a persisted
/// "previous status" after an involuntary termination. Both mutations
/// are idempotent; once `previous_status` is null the affordance is
/// gone. A failed call leaves the affordance and controls usable.
pub struct ResumeController {
    http: Client,
    server_url: String,
    kind: EntityKind,
    entity_id: i64,
    inner: Mutex<ResumeInner>,
}

#[derive(Debug, Default)]
struct ResumeInner {
    previous_status: Option<String>,
    last_error: Option<String>,
    in_flight: bool,
}

impl ResumeController {
    pub fn new(server_url: impl Into<String>, snapshot: &EntitySnapshot) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            kind: snapshot.kind,
            entity_id: snapshot.id,
            inner: Mutex::new(ResumeInner {
                previous_status: snapshot.previous_status.clone(),
                last_error: None,
                in_flight: false,
            }),
        }
    }

    pub async fn offers_resume(&self) -> bool {
        self.inner.lock().await.previous_status.is_some()
    }

    pub async fn previous_status(&self) -> Option<String> {
        self.inner.lock().await.previous_status.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn is_in_flight(&self) -> bool {
        self.inner.lock().await.in_flight
    }

    /// Restores the previous status as current and clears the field.
    pub async fn resume(&self) -> Result<EntitySnapshot> {
        self.mutate("resume").await
    }

    /// Accepts the termination as final: discards the previous status
    /// without changing the current one.
    pub async fn clear(&self) -> Result<EntitySnapshot> {
        self.mutate("resume/clear").await
    }

    async fn mutate(&self, suffix: &str) -> Result<EntitySnapshot> {
        {
            let mut inner = self.inner.lock().await;
            if inner.in_flight {
                return Err(anyhow!("a resume call is already in flight"));
            }
            inner.in_flight = true;
            inner.last_error = None;
        }

        let url = format!(
            "{}/{}/{}/{suffix}",
            self.server_url,
            self.kind.path_segment(),
            self.entity_id
        );
        let result = async {
            let snapshot: EntitySnapshot = self
                .http
                .post(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<EntitySnapshot, reqwest::Error>(snapshot)
        }
        .await;

        // The in-flight flag always drops here, success or not, so the
        // controls never wedge in a loading state.
        let mut inner = self.inner.lock().await;
        inner.in_flight = false;
        match result {
            Ok(snapshot) => {
                info!(
                    entity_id = self.entity_id,
                    kind = ?self.kind,
                    status = %snapshot.status,
                    "resume mutation applied"
                );
                inner.previous_status = snapshot.previous_status.clone();
                Ok(snapshot)
            }
            Err(err) => {
                warn!(
                    entity_id = self.entity_id,
                    kind = ?self.kind,
                    "resume mutation failed: {err}"
                );
                inner.last_error = Some(err.to_string());
                Err(err).with_context(|| {
                    format!(
                        "failed {suffix} for {} {}",
                        self.kind.path_segment(),
                        self.entity_id
                    )
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/resume_tests.rs"]
mod tests;
