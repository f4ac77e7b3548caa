//! Output-stream broker (C10): `GET /stream` — best-effort SSE fan-out of
//! sandbox stdout/stderr chunks to however many subscribers are connected.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broker::auth::check_bearer;
use crate::broker::error_body;
use crate::error::ErrorKind;

const CHANNEL_CAPACITY: usize = 256;

/// One chunk of sandbox output, or the terminal marker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputEvent {
    Output { stream: OutputStreamKind, chunk: String },
    Complete { exit_success: bool },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStreamKind {
    Stdout,
    Stderr,
}

pub struct OutputBroker {
    token: String,
    sender: broadcast::Sender<OutputEvent>,
}

impl OutputBroker {
    pub fn new(token: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { token: token.into(), sender }
    }

    /// Publish a chunk. Best-effort: if every receiver's buffer is full the
    /// broadcast channel drops the oldest entries for slow subscribers
    /// rather than this call ever blocking the sandbox's I/O pump. If there
    /// are no subscribers at all, `send` errors and the chunk is discarded.
    pub fn publish(&self, event: OutputEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.sender.subscribe()
    }
}

pub fn router(state: Arc<OutputBroker>) -> Router {
    Router::new().route("/stream", get(handle_stream)).with_state(state)
}

async fn handle_stream(State(state): State<Arc<OutputBroker>>, headers: HeaderMap) -> Response {
    if !check_bearer(&headers, &state.token) {
        let (status, body) = error_body(ErrorKind::Forbidden, "unauthorized", None);
        return (status, body).into_response();
    }

    let rx = state.subscribe();
    let events = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok::<Event, Infallible>(Event::default().json_data(&event).unwrap()), rx)),
                // A lagged receiver missed chunks because it fell behind a
                // full buffer; skip silently and keep reading rather than
                // surfacing a stream error.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}
