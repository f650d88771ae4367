//! Server-sent-event endpoints for the controller watches.
//!
//! Each request spawns the watch on its own task with a fresh child of the
//! shutdown token. Items arrive as default (`message`) events carrying
//! JSON. When the watch ends the stream emits one terminal event (`end`,
//! or `error` with the error envelope) and closes. A client that
//! disconnects drops the stream, which cancels the watch.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use kinto_controller::{ControlResult, JobStatusCallback, SinkError};
use kinto_core::JobStatus;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::ApiState;
use crate::response::ApiResponse;

/// Events buffered between the watch task and the HTTP stream.
const WATCH_BUFFER: usize = 64;

struct Streaming<T> {
    rx: mpsc::Receiver<T>,
    task: Option<JoinHandle<ControlResult<()>>>,
    _cancel_on_drop: DropGuard,
}

/// Run `start` on a task and expose what it sends as an SSE stream.
fn sse_watch<T, F, Fut>(
    shutdown: &CancellationToken,
    start: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<T, F, Fut>>
where
    T: Serialize + Send + 'static,
    F: FnOnce(CancellationToken, mpsc::Sender<T>) -> Fut,
    Fut: Future<Output = ControlResult<()>> + Send + 'static,
{
    let cancel = shutdown.child_token();
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let task = tokio::spawn(start(cancel.clone(), tx));

    let state = Streaming {
        rx,
        task: Some(task),
        _cancel_on_drop: cancel.drop_guard(),
    };
    let events = stream::unfold(state, |mut state| async move {
        if let Some(item) = state.rx.recv().await {
            let event = Event::default()
                .json_data(&item)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            return Some((Ok(event), state));
        }
        let task = state.task.take()?;
        Some((Ok(terminal_event(task.await)), state))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn terminal_event(outcome: Result<ControlResult<()>, tokio::task::JoinError>) -> Event {
    match outcome {
        Ok(Ok(())) => Event::default().event("end").data("watch ended"),
        Ok(Err(e)) => {
            debug!(kind = e.kind().as_str(), error = %e, "watch failed");
            let body = ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(e.to_string()),
                kind: Some(e.kind().as_str()),
            };
            Event::default()
                .event("error")
                .json_data(&body)
                .unwrap_or_else(|_| Event::default().event("error").data(e.to_string()))
        }
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

/// GET /api/v1/environments/:env/blocks/:block/watch/releases
pub async fn releases_status(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let api = state.api.clone();
    sse_watch(&state.shutdown, move |cancel, tx| async move {
        api.watch_releases_status(&block, &env, &cancel, tx).await
    })
}

/// GET /api/v1/environments/:env/blocks/:block/watch/jobs
pub async fn jobs_status(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let api = state.api.clone();
    sse_watch(&state.shutdown, move |cancel, tx: mpsc::Sender<JobStatus>| async move {
        let callback: JobStatusCallback = Box::new(move |status: JobStatus| match tx.try_send(status) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError("client is not keeping up".to_string())),
            Err(TrySendError::Closed(_)) => Err(SinkError("client disconnected".to_string())),
        });
        api.watch_jobs_status(&block, &env, &cancel, callback).await
    })
}

/// GET /api/v1/environments/:env/blocks/:block/watch/console
pub async fn console_logs(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let api = state.api.clone();
    sse_watch(&state.shutdown, move |cancel, tx| async move {
        api.watch_console_logs(&block, &env, &cancel, tx).await
    })
}

/// GET /api/v1/environments/:env/blocks/:block/releases/:release/logs
pub async fn build_logs(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let api = state.api.clone();
    sse_watch(&state.shutdown, move |cancel, tx| async move {
        api.watch_build_logs(&release, &block, &env, &cancel, tx)
            .await
    })
}
