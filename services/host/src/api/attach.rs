//! `POST /host/attach`.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{
        header::{CONNECTION, CONTENT_TYPE, UPGRADE},
        StatusCode,
    },
    response::Response,
};
use corral_proto::attach::{AttachReq, ATTACH_CONTENT_TYPE, ATTACH_UPGRADE};
use hyper_util::rt::TokioIo;
use tracing::warn;

use super::{ApiError, ApiState};

const MAX_REQUEST_LEN: usize = 64 * 1024;

/// Reads the [`AttachReq`] body, answers `101 Switching Protocols` and runs
/// the session on the upgraded connection.
pub(super) async fn attach(
    State(state): State<ApiState>,
    mut req: Request,
) -> Result<Response, ApiError> {
    let wants_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(ATTACH_UPGRADE));
    if !wants_upgrade {
        return Err(ApiError::bad_request(
            "upgrade_required",
            format!("attach requires `Upgrade: {ATTACH_UPGRADE}`"),
        ));
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let body = to_bytes(req.into_body(), MAX_REQUEST_LEN)
        .await
        .map_err(|e| ApiError::bad_request("invalid_attach_request", e.to_string()))?;
    let attach_req: AttachReq = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("invalid_attach_request", e.to_string()))?;

    let service = state.attach.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => service.serve(attach_req, TokioIo::new(upgraded)).await,
            Err(e) => warn!(error = %e, "Attach upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, ATTACH_UPGRADE)
        .header(CONTENT_TYPE, ATTACH_CONTENT_TYPE)
        .body(Body::empty())
        .map_err(|e| ApiError::internal("response_build_failed", e.to_string()))
}
