//! Host HTTP API.
//!
//! ```text
//! GET  /host/jobs                      active jobs, oldest first
//! GET  /host/jobs/{id}                 one active job
//! GET  /host/jobs/{id}/events          NDJSON events of one job, ends at exit
//! POST /host/jobs/{id}/stop            graceful stop
//! POST /host/jobs/{id}/resize          ?cols=&rows= for TTY jobs
//! GET  /host/events                    NDJSON events of every job
//! POST /host/attach                    upgrades to the attach protocol
//! ```

mod attach;
pub mod error;
mod jobs;

use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::attach::AttachService;
use crate::runner::Runner;

pub use error::{ApiError, ProblemDetails};

#[derive(Clone)]
pub struct ApiState {
    pub runner: Arc<Runner>,
    pub attach: AttachService,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/host/jobs", get(jobs::list))
        .route("/host/jobs/{id}", get(jobs::get))
        .route("/host/jobs/{id}/events", get(jobs::job_events))
        .route("/host/jobs/{id}/stop", post(jobs::stop))
        .route("/host/jobs/{id}/resize", post(jobs::resize))
        .route("/host/events", get(jobs::all_events))
        .route("/host/attach", post(attach::attach))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: crate::SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
