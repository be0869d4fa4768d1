//! SLA reasons and their battery-version/period associations.
//!
//! Plain CRUD over the catalog store; nothing here feeds the aggregates.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;

use super::AppState;
use crate::error::{SlaError, SlaResult};
use crate::models::{
    ApiResponse, AttachedReason, BatteryVersion, BatteryVersionReason, Period, SlaReason,
};

// ---

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
}

impl ReasonBody {
    fn text(&self) -> SlaResult<&str> {
        let reason = self.reason.trim();
        if reason.is_empty() {
            return Err(SlaError::validation("reason must not be empty"));
        }
        Ok(reason)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachBody {
    reason_id: i64,
    battery_version: BatteryVersion,
    period: Period,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociationQuery {
    battery_version: BatteryVersion,
    period: Period,
}

async fn list_reasons(State(state): State<AppState>) -> SlaResult<Json<ApiResponse<Vec<SlaReason>>>> {
    let rows = state.catalog.list_reasons().await?;
    Ok(Json(ApiResponse::ok(rows)))
}

async fn create_reason(
    State(state): State<AppState>,
    Json(body): Json<ReasonBody>,
) -> SlaResult<Json<ApiResponse<SlaReason>>> {
    // ---
    let row = state.catalog.create_reason(body.text()?).await?;
    Ok(Json(ApiResponse::ok(row).with_message("Reason created")))
}

async fn update_reason(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ReasonBody>,
) -> SlaResult<Json<ApiResponse<SlaReason>>> {
    // ---
    let row = state
        .catalog
        .update_reason(id, body.text()?)
        .await?
        .ok_or_else(|| SlaError::not_found(format!("Reason {id} not found")))?;
    Ok(Json(ApiResponse::ok(row)))
}

async fn delete_reason(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> SlaResult<Json<ApiResponse<i64>>> {
    // ---
    if !state.catalog.delete_reason(id).await? {
        return Err(SlaError::not_found(format!("Reason {id} not found")));
    }
    Ok(Json(ApiResponse::ok(id).with_message("Reason deleted")))
}

async fn list_attached(
    State(state): State<AppState>,
    Query(query): Query<AssociationQuery>,
) -> SlaResult<Json<ApiResponse<Vec<AttachedReason>>>> {
    // ---
    let rows = state
        .catalog
        .attached_reasons(query.battery_version, &query.period)
        .await?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// Attaching the same reason twice to one version and period answers 409.
async fn attach_reason(
    State(state): State<AppState>,
    Json(body): Json<AttachBody>,
) -> SlaResult<Json<ApiResponse<BatteryVersionReason>>> {
    // ---
    let row = state
        .catalog
        .attach_reason(body.reason_id, body.battery_version, &body.period)
        .await?
        .ok_or_else(|| SlaError::not_found(format!("Reason {} not found", body.reason_id)))?;
    Ok(Json(ApiResponse::ok(row).with_message("Reason attached")))
}

async fn detach_reason(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> SlaResult<Json<ApiResponse<i64>>> {
    // ---
    if !state.catalog.detach_reason(id).await? {
        return Err(SlaError::not_found(format!("Association {id} not found")));
    }
    Ok(Json(ApiResponse::ok(id)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sla/reasons", get(list_reasons).post(create_reason))
        .route("/api/sla/reasons/{id}", put(update_reason).delete(delete_reason))
        .route(
            "/api/sla/reasons/battery-version",
            get(list_attached).post(attach_reason),
        )
        .route("/api/sla/reasons/battery-version/{id}", delete(detach_reason))
}
