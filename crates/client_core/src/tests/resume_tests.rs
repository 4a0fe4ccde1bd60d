use super::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;

#[derive(Default)]
struct MockResumeServer {
    resume_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    /// Remaining 500 responses before the server recovers.
    failures: AtomicUsize,
    /// Artificial handling delay, for overlap tests.
    delay: Option<Duration>,
}

impl MockResumeServer {
    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

fn segment_snapshot(id: i64, status: &str, previous_status: Option<&str>) -> EntitySnapshot {
    EntitySnapshot {
        kind: EntityKind::Segment,
        id,
        status: status.into(),
        previous_status: previous_status.map(Into::into),
        updated_at: Utc::now(),
    }
}

async fn resume_route(
    State(state): State<Arc<MockResumeServer>>,
    Path(id): Path<i64>,
) -> Response {
    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }
    state.resume_calls.fetch_add(1, Ordering::SeqCst);
    if state.take_failure() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(segment_snapshot(id, "recording", None)).into_response()
}

async fn clear_route(
    State(state): State<Arc<MockResumeServer>>,
    Path(id): Path<i64>,
) -> Response {
    state.clear_calls.fetch_add(1, Ordering::SeqCst);
    Json(segment_snapshot(id, "terminated", None)).into_response()
}

async fn spawn_resume_server(state: Arc<MockResumeServer>) -> String {
    let app = Router::new()
        .route("/segments/:id/resume", post(resume_route))
        .route("/segments/:id/resume/clear", post(clear_route))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock resume server");
    let addr = listener.local_addr().expect("mock server address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock resume server");
    });
    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_restores_the_previous_status_and_clears_the_affordance() {
    let state = Arc::new(MockResumeServer::default());
    let server_url = spawn_resume_server(Arc::clone(&state)).await;
    let controller =
        ResumeController::new(server_url, &segment_snapshot(5, "terminated", Some("recording")));

    assert!(controller.offers_resume().await);
    assert_eq!(
        controller.previous_status().await.as_deref(),
        Some("recording")
    );

    let snapshot = controller.resume().await.expect("resume call");
    assert_eq!(snapshot.status, "recording");
    assert!(!controller.offers_resume().await);
    assert_eq!(controller.last_error().await, None);
    assert_eq!(state.resume_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_resume_keeps_the_affordance_and_controls_usable() {
    let state = Arc::new(MockResumeServer {
        failures: AtomicUsize::new(1),
        ..MockResumeServer::default()
    });
    let server_url = spawn_resume_server(Arc::clone(&state)).await;
    let controller =
        ResumeController::new(server_url, &segment_snapshot(5, "terminated", Some("recording")));

    controller.resume().await.expect_err("first call hits a 500");
    assert!(controller.offers_resume().await);
    assert!(controller.last_error().await.is_some());
    assert!(!controller.is_in_flight().await);

    // The server has recovered; the same control works again.
    controller.resume().await.expect("second call succeeds");
    assert!(!controller.offers_resume().await);
    assert_eq!(controller.last_error().await, None);
    assert_eq!(state.resume_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_discards_the_previous_status_without_resuming() {
    let state = Arc::new(MockResumeServer::default());
    let server_url = spawn_resume_server(Arc::clone(&state)).await;
    let controller =
        ResumeController::new(server_url, &segment_snapshot(5, "terminated", Some("recording")));

    let snapshot = controller.clear().await.expect("clear call");
    assert_eq!(snapshot.status, "terminated");
    assert!(!controller.offers_resume().await);
    assert_eq!(state.clear_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.resume_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_mutations_are_rejected_while_one_is_in_flight() {
    let state = Arc::new(MockResumeServer {
        delay: Some(Duration::from_millis(300)),
        ..MockResumeServer::default()
    });
    let server_url = spawn_resume_server(Arc::clone(&state)).await;
    let controller = Arc::new(ResumeController::new(
        server_url,
        &segment_snapshot(5, "terminated", Some("recording")),
    ));

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.resume().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.is_in_flight().await);

    let err = controller
        .resume()
        .await
        .expect_err("second call while the first is in flight");
    assert!(err.to_string().contains("in flight"));

    first
        .await
        .expect("first task joins")
        .expect("first call succeeds");
    assert!(!controller.offers_resume().await);
    assert_eq!(state.resume_calls.load(Ordering::SeqCst), 1);
}
