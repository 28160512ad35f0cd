use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use civicsignal_common::{CivicSignalError, ClusterStatus, RawReport, StatusFilter};

use crate::AppState;

// --- Request structs ---

#[derive(Deserialize)]
pub struct ClustersQuery {
    status: Option<String>,
    include_reports: Option<bool>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct UpdateClusterRequest {
    status: Option<String>,
}

// --- Helpers ---

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn error_response(e: CivicSignalError) -> Response {
    let status = match &e {
        CivicSignalError::Validation(_) => StatusCode::BAD_REQUEST,
        CivicSignalError::NotFound(_) => StatusCode::NOT_FOUND,
        CivicSignalError::StaleState(_) | CivicSignalError::Conflict(_) => StatusCode::CONFLICT,
        CivicSignalError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// Target status from an optional PATCH body. No body means resolve.
fn requested_status(body: &[u8]) -> Result<ClusterStatus, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ClusterStatus::Resolved);
    }
    let request: UpdateClusterRequest =
        serde_json::from_slice(body).map_err(|e| format!("Invalid JSON body: {e}"))?;
    match request.status {
        Some(status) => status.parse(),
        None => Ok(ClusterStatus::Resolved),
    }
}

// --- Handlers ---

/// Submit a report and cluster it in one step.
pub async fn api_submit_report(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RawReport>, JsonRejection>,
) -> Response {
    let Json(raw) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match state.engine.ingest(raw).await {
        Ok((report, cluster)) => Json(serde_json::json!({
            "success": true,
            "report": report,
            "cluster": cluster,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn api_clusters(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClustersQuery>,
) -> Response {
    let filter = StatusFilter::from_query(params.status.as_deref());

    if params.include_reports.unwrap_or(false) {
        match state.engine.list_with_reports(filter, params.limit).await {
            Ok(clusters) => Json(serde_json::json!({ "clusters": clusters })).into_response(),
            Err(e) => error_response(e),
        }
    } else {
        match state.engine.list(filter, params.limit).await {
            Ok(clusters) => Json(serde_json::json!({ "clusters": clusters })).into_response(),
            Err(e) => error_response(e),
        }
    }
}

/// Advance a cluster's status. An empty body resolves it.
pub async fn api_update_cluster(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Bytes,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let target = match requested_status(&body) {
        Ok(target) => target,
        Err(message) => return bad_request(message),
    };

    match state.engine.transition(id, target).await {
        Ok(cluster) => Json(serde_json::json!({
            "success": true,
            "cluster": cluster,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}
