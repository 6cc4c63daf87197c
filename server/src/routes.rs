use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use code_gate_common::frame::AnnotatedFrame;
use code_gate_common::multipart;
use code_gate_common::slot::LatestSlot;
use code_gate_common::verdict::Verdict;
use serde::Serialize;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub frames: Arc<LatestSlot<AnnotatedFrame>>,
    pub jpeg_quality: u8,
    /// Pause between two parts of a stream.
    pub idle_sleep: Duration,
    /// Cleared at shutdown; open streams end when they see it.
    pub running: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct FrameStatus {
    seq: u64,
    captured_at_ms: i64,
    verdict: Option<Verdict>,
    payload: Option<String>,
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>code-gate</title>
  </head>
  <body>
    <h1>Live view</h1>
    <img src="/video_feed" alt="live camera stream">
  </body>
</html>
"#;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/snapshot.jpg", get(snapshot))
        .route("/status", get(status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Encode on the blocking pool. `None` means the frame cannot be served.
async fn encode(frame: Arc<AnnotatedFrame>, quality: u8) -> Option<Bytes> {
    let seq = frame.seq;
    match tokio::task::spawn_blocking(move || frame.jpeg(quality)).await {
        Ok(Ok(jpeg)) => Some(jpeg),
        Ok(Err(e)) => {
            warn!(seq, error = %e, "JPEG encode failed, frame skipped");
            None
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            None
        }
    }
}

/// GET /video_feed: endless multipart stream of the current frame.
///
/// The current slot content is sent on every pass, one idle interval apart.
/// A part only counts as complete once the next boundary arrives, so an
/// unchanged frame is sent again rather than held back.
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    debug!("stream client connected");
    let parts = futures_util::stream::unfold((state, true), |(state, first)| async move {
        if !first {
            tokio::time::sleep(state.idle_sleep).await;
        }
        loop {
            if !state.running.load(Ordering::Relaxed) {
                return None;
            }
            let Some(frame) = state.frames.snapshot() else {
                tokio::time::sleep(state.idle_sleep).await;
                continue;
            };
            // Repeats of the same frame hit the JPEG cache.
            if let Some(jpeg) = encode(frame, state.jpeg_quality).await {
                let part = multipart::encode_part(&jpeg);
                return Some((Ok::<_, Infallible>(part), (state, false)));
            }
            tokio::time::sleep(state.idle_sleep).await;
        }
    });

    (
        [
            (header::CONTENT_TYPE, multipart::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// GET /snapshot.jpg: the current frame, or 204 before the first one.
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    let Some(frame) = state.frames.snapshot() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match encode(frame, state.jpeg_quality).await {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// GET /status: metadata of the current frame, or 204 before the first one.
async fn status(State(state): State<Arc<AppState>>) -> Response {
    let Some(frame) = state.frames.snapshot() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    Json(FrameStatus {
        seq: frame.seq,
        captured_at_ms: frame.captured_at_ms,
        verdict: frame.verdict,
        payload: frame.payload.clone(),
    })
    .into_response()
}
