use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use reqwest::Client;
use serde::Serialize;
use shared::domain::{SegmentId, UploadId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::retry::{classify_http, execute, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    Pending,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChunkStatus {
    pub index: u64,
    pub ack: ChunkAck,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Recording,
    Draining,
    Finalizing,
    Done,
    /// Terminal but recoverable: surfaced to the operator with a manual
    /// retry control, never silently dropped.
    FinalizeFailed,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session already stopped")]
    AlreadyStopped,
    #[error("finalize retry is only available after finalize has failed")]
    FinalizeNotFailed,
    #[error("{failed} chunk(s) failed to upload; pass force to finalize anyway")]
    FailedChunks { failed: usize },
    #[error("finalize request failed: {0}")]
    Finalize(#[from] reqwest::Error),
}

enum WorkerMessage {
    Chunk { index: u64, bytes: Vec<u8> },
    Stop,
}

#[derive(Debug, Serialize)]
struct FinalizeRequest {
    chunk_count: u64,
    force: bool,
}

/// Sequences locally produced media chunks for one recording session.
/// Chunks upload strictly one at a time in index order (the server
/// concatenates acked chunks by index), and finalize is only issued
/// once recording has stopped and no chunk upload is in flight: the
/// stop marker travels through the same queue as the chunks.
pub struct UploadSession {
    shared: Arc<UploadShared>,
    queue: mpsc::UnboundedSender<WorkerMessage>,
    next_index: AtomicU64,
    stopped: AtomicBool,
}

struct UploadShared {
    http: Client,
    server_url: String,
    segment_id: SegmentId,
    upload_id: UploadId,
    policy: RetryPolicy,
    chunks: Mutex<BTreeMap<u64, ChunkStatus>>,
    phase: watch::Sender<UploadPhase>,
}

impl UploadSession {
    pub fn new(
        server_url: impl Into<String>,
        segment_id: SegmentId,
        upload_id: UploadId,
    ) -> Self {
        Self::new_with_policy(server_url, segment_id, upload_id, RetryPolicy::default())
    }

    pub fn new_with_policy(
        server_url: impl Into<String>,
        segment_id: SegmentId,
        upload_id: UploadId,
        policy: RetryPolicy,
    ) -> Self {
        let (phase, _) = watch::channel(UploadPhase::Recording);
        let shared = Arc::new(UploadShared {
            http: Client::new(),
            server_url: server_url.into(),
            segment_id,
            upload_id,
            policy,
            chunks: Mutex::new(BTreeMap::new()),
            phase,
        });
        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Arc::clone(&shared), receiver));
        Self {
            shared,
            queue,
            next_index: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Enqueues one chunk under the next strictly increasing index.
    /// The chunk table lock also orders pushes against `stop`: a chunk
    /// accepted here is queued ahead of the stop marker, so the worker
    /// always uploads it before finalizing.
    pub fn push_chunk(&self, bytes: Vec<u8>) -> Result<u64, UploadError> {
        let mut chunks = self.shared.chunks.lock().expect("chunk table lock");
        if self.stopped.load(Ordering::SeqCst) {
            return Err(UploadError::AlreadyStopped);
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        chunks.insert(
            index,
            ChunkStatus {
                index,
                ack: ChunkAck::Pending,
                retry_count: 0,
            },
        );
        if self.queue.send(WorkerMessage::Chunk { index, bytes }).is_err() {
            chunks.remove(&index);
            return Err(UploadError::AlreadyStopped);
        }
        Ok(index)
    }

    /// Signals the end of recording. Finalize runs once every queued
    /// chunk (including any currently in flight) has resolved.
    pub fn stop(&self) -> Result<(), UploadError> {
        let _chunks = self.shared.chunks.lock().expect("chunk table lock");
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(UploadError::AlreadyStopped);
        }
        self.shared.phase.send_replace(UploadPhase::Draining);
        if self.queue.send(WorkerMessage::Stop).is_err() {
            return Err(UploadError::AlreadyStopped);
        }
        Ok(())
    }

    /// Manual retry control for the `FinalizeFailed` state. Chunks that
    /// exhausted their own retries block finalize unless `force` is set.
    pub async fn retry_finalize(&self, force: bool) -> Result<(), UploadError> {
        if self.phase() != UploadPhase::FinalizeFailed {
            return Err(UploadError::FinalizeNotFailed);
        }
        let failed = self.shared.failed_chunk_count();
        if failed > 0 && !force {
            return Err(UploadError::FailedChunks { failed });
        }
        self.shared.phase.send_replace(UploadPhase::Finalizing);
        match self.shared.finalize_call(force).await {
            Ok(()) => {
                self.shared.phase.send_replace(UploadPhase::Done);
                Ok(())
            }
            Err(err) => {
                error!(
                    upload_id = self.shared.upload_id.0,
                    "manual finalize retry failed: {err}"
                );
                self.shared.phase.send_replace(UploadPhase::FinalizeFailed);
                Err(UploadError::Finalize(err))
            }
        }
    }

    pub fn phase(&self) -> UploadPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<UploadPhase> {
        self.shared.phase.subscribe()
    }

    pub fn chunk_statuses(&self) -> Vec<ChunkStatus> {
        self.shared
            .chunks
            .lock()
            .expect("chunk table lock")
            .values()
            .cloned()
            .collect()
    }
}

async fn run_worker(shared: Arc<UploadShared>, mut queue: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = queue.recv().await {
        match message {
            WorkerMessage::Chunk { index, bytes } => shared.upload_chunk(index, bytes).await,
            WorkerMessage::Stop => {
                shared.finalize_after_drain().await;
                return;
            }
        }
    }
    // Session dropped without a stop; the recording was abandoned and
    // its chunks are discarded server-side by upload-id expiry.
}

impl UploadShared {
    fn chunk_url(&self, index: u64) -> String {
        format!(
            "{}/segments/{}/uploads/{}/chunks/{}",
            self.server_url, self.segment_id.0, self.upload_id.0, index
        )
    }

    fn failed_chunk_count(&self) -> usize {
        self.chunks
            .lock()
            .expect("chunk table lock")
            .values()
            .filter(|status| status.ack == ChunkAck::Failed)
            .count()
    }

    fn record_chunk_outcome(&self, index: u64, ack: ChunkAck, retry_count: u32) {
        if let Some(status) = self
            .chunks
            .lock()
            .expect("chunk table lock")
            .get_mut(&index)
        {
            status.ack = ack;
            status.retry_count = retry_count;
        }
    }

    /// Uploads one chunk through the retry wrapper. Chunk upload is
    /// idempotent by index, which is what makes the retry safe.
    async fn upload_chunk(&self, index: u64, bytes: Vec<u8>) {
        let url = self.chunk_url(index);
        let attempts = AtomicU32::new(0);
        let result = execute(
            self.policy,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let request = self.http.post(&url).body(bytes.clone());
                async move {
                    request.send().await?.error_for_status()?;
                    Ok::<(), reqwest::Error>(())
                }
            },
            classify_http,
        )
        .await;
        let retry_count = attempts.load(Ordering::SeqCst).saturating_sub(1);
        match result {
            Ok(()) => {
                info!(
                    segment_id = self.segment_id.0,
                    index, retry_count, "chunk uploaded"
                );
                self.record_chunk_outcome(index, ChunkAck::Uploaded, retry_count);
            }
            Err(err) => {
                error!(
                    segment_id = self.segment_id.0,
                    index, retry_count, "chunk upload failed: {err}"
                );
                self.record_chunk_outcome(index, ChunkAck::Failed, retry_count);
            }
        }
    }

    async fn finalize_after_drain(&self) {
        let failed = self.failed_chunk_count();
        if failed > 0 {
            warn!(
                upload_id = self.upload_id.0,
                failed, "not finalizing automatically with failed chunks"
            );
            self.phase.send_replace(UploadPhase::FinalizeFailed);
            return;
        }
        self.phase.send_replace(UploadPhase::Finalizing);
        match self.finalize_call(false).await {
            Ok(()) => {
                info!(upload_id = self.upload_id.0, "upload finalized");
                self.phase.send_replace(UploadPhase::Done);
            }
            Err(err) => {
                error!(
                    upload_id = self.upload_id.0,
                    "finalize failed after retries: {err}"
                );
                self.phase.send_replace(UploadPhase::FinalizeFailed);
            }
        }
    }

    /// Finalize is a no-op server-side when nothing is outstanding, so
    /// retrying it is safe.
    async fn finalize_call(&self, force: bool) -> Result<(), reqwest::Error> {
        let url = format!(
            "{}/segments/{}/uploads/{}/finalize",
            self.server_url, self.segment_id.0, self.upload_id.0
        );
        let chunk_count = self.chunks.lock().expect("chunk table lock").len() as u64;
        execute(
            self.policy,
            || {
                let request = self
                    .http
                    .post(&url)
                    .json(&FinalizeRequest { chunk_count, force });
                async move {
                    request.send().await?.error_for_status()?;
                    Ok::<(), reqwest::Error>(())
                }
            },
            classify_http,
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
