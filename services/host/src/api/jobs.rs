//! Job inspection and control handlers.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use bytes::Bytes;
use corral_events::{Event, EventKind};
use corral_id::JobId;
use corral_proto::ActiveJob;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::{ApiError, ApiState};
use crate::agent::stopped;
use crate::state::StopAction;

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|e| ApiError::bad_request("invalid_job_id", e.to_string()))
}

fn lookup(state: &ApiState, raw: &str) -> Result<ActiveJob, ApiError> {
    let id = parse_id(raw)?;
    state
        .runner
        .table()
        .get(&id)
        .ok_or_else(|| ApiError::not_found("job_not_found", format!("job {id} not found")))
}

pub(super) async fn list(State(state): State<ApiState>) -> Json<Vec<ActiveJob>> {
    Json(state.runner.table().list())
}

pub(super) async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ActiveJob>, ApiError> {
    lookup(&state, &id).map(Json)
}

pub(super) async fn stop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ActiveJob>), ApiError> {
    let id = parse_id(&id)?;
    let action = state.runner.stop(&id).await?;
    let job = lookup(&state, id.as_str())?;
    let status = match action {
        StopAction::AlreadyTerminal => StatusCode::OK,
        _ => StatusCode::ACCEPTED,
    };
    Ok((status, Json(job)))
}

#[derive(Debug, Deserialize)]
pub(super) struct ResizeQuery {
    cols: u16,
    rows: u16,
}

pub(super) async fn resize(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(size): Query<ResizeQuery>,
) -> Result<StatusCode, ApiError> {
    let job = lookup(&state, &id)?;
    if job.is_terminal() {
        return Err(ApiError::conflict(
            "job_not_running",
            format!("job {} is {}", job.job.id, job.status),
        ));
    }
    let container_id = job.container_id.ok_or_else(|| {
        ApiError::conflict("job_not_running", format!("job {} has not started", job.job.id))
    })?;
    state
        .runner
        .executor()
        .resize(&container_id, size.cols, size.rows)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn job_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let (history, rx) = state.runner.table().subscribe_job(&id)?;
    Ok(ndjson(EventFeed {
        pending: history.into(),
        live: rx,
        shutdown: state.shutdown.clone(),
        until_exit: true,
        done: false,
    }))
}

pub(super) async fn all_events(State(state): State<ApiState>) -> Response {
    let rx = state.runner.table().subscribe(None);
    ndjson(EventFeed {
        pending: VecDeque::new(),
        live: rx,
        shutdown: state.shutdown.clone(),
        until_exit: false,
        done: false,
    })
}

struct EventFeed {
    pending: VecDeque<Event>,
    live: mpsc::UnboundedReceiver<Event>,
    shutdown: watch::Receiver<bool>,
    /// End after the job's terminal event.
    until_exit: bool,
    done: bool,
}

impl EventFeed {
    async fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        let event = match self.pending.pop_front() {
            Some(event) => event,
            None => tokio::select! {
                event = self.live.recv() => event?,
                _ = stopped(&mut self.shutdown) => return None,
            },
        };
        if self.until_exit && matches!(event.kind, EventKind::Stop | EventKind::Error) {
            self.done = true;
        }
        Some(event)
    }
}

fn ndjson(feed: EventFeed) -> Response {
    let stream = futures::stream::unfold(feed, |mut feed| async move {
        loop {
            let event = feed.next().await?;
            match event.to_ndjson() {
                Ok(line) => {
                    return Some((Ok::<Bytes, Infallible>(Bytes::from(line)), feed));
                }
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}
