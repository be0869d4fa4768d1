//! Current down/up site lists and manual reconciliation.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::AppState;
use crate::error::SlaResult;
use crate::models::{ApiResponse, SiteStatusKind, SiteStatusRecord};
use crate::reconcile::SyncReport;

// ---

/// `GET /api/site-status/{status}` where status is `down` or `up`.
async fn list(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> SlaResult<Json<ApiResponse<Vec<SiteStatusRecord>>>> {
    // ---
    let kind: SiteStatusKind = status.parse()?;
    let rows = state.reconcile.list(kind).await?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// `POST /api/site-status/{status}/sync`
async fn sync(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> SlaResult<Json<ApiResponse<SyncReport>>> {
    // ---
    let kind: SiteStatusKind = status.parse()?;
    let report = state.reconcile.sync(kind).await?;
    Ok(Json(ApiResponse::ok(report)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/site-status/{status}", get(list))
        .route("/api/site-status/{status}/sync", post(sync))
}
