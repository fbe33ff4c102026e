//! HTTP surface: `GET <stream_path>` streams MP3, everything else is 404.
//!
//! Every request runs its own `StreamSession` on its own task; sessions
//! share nothing but the read-only `SessionContext`.

use std::io;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::session::{BodyChunk, SessionContext, StreamSession};

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct AppState {
    sessions: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(sessions: SessionContext, shutdown: CancellationToken) -> Self {
        Self {
            sessions: Arc::new(sessions),
            shutdown,
        }
    }
}

pub fn router(stream_path: &str, state: AppState) -> Router {
    Router::new()
        .route(stream_path, get(handle_stream))
        .fallback(not_found)
        .with_state(state)
}

/// Serve until the state's shutdown token fires. Open sessions are
/// cancelled through the same token.
pub async fn serve(listener: TcpListener, stream_path: &str, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(stream_path, state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Body channel with one slot held back, so a failed session can abort the
/// body even when a slow client has let the queue fill up.
fn body_channel(
    depth: usize,
) -> Option<(mpsc::Sender<BodyChunk>, OwnedPermit<BodyChunk>, mpsc::Receiver<BodyChunk>)> {
    let (tx, rx) = mpsc::channel(depth.max(1) + 1);
    let abort = tx.clone().try_reserve_owned().ok()?;
    Some((tx, abort, rx))
}

async fn handle_stream(State(state): State<AppState>) -> Response {
    let mut session = match StreamSession::open(&state.sessions, &state.shutdown).await {
        Ok(session) => session,
        Err(e) => {
            log::warn!("Stream request rejected: {}", e);
            return (e.http_status(), e.to_string()).into_response();
        }
    };

    let Some((tx, abort, rx)) = body_channel(state.sessions.config.body_queue_depth) else {
        session.close().await;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    tokio::spawn(async move {
        let end = session.run(tx).await;
        // Headers are gone already; abort the body so the client sees a cut
        // connection instead of a clean end.
        if end.is_failure() {
            abort.send(Err(io::Error::other(end.to_string())));
        }
    });

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}
