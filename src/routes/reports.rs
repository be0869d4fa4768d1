//! Problem reports attached to a site and day.
//!
//! Every mutation drops the cached aggregates for the affected date, since the
//! daily detail and master views embed the latest problem.

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use super::{AppState, RangeQuery};
use crate::error::{SlaError, SlaResult};
use crate::models::{ApiResponse, DateRange, NewReport, ProblemUpdate, SlaReport, SlaReportProblem};

// ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteFilter {
    site_id: Option<String>,
}

/// `POST /api/sla/reports`
async fn create_report(
    State(state): State<AppState>,
    Json(body): Json<NewReport>,
) -> SlaResult<Json<ApiResponse<SlaReport>>> {
    // ---
    if body.site_id.trim().is_empty() {
        return Err(SlaError::validation("siteId is required"));
    }
    if body.problems.iter().any(|p| p.description.trim().is_empty()) {
        return Err(SlaError::validation("Every problem needs a description"));
    }

    let report = state.store.create_report(&body).await?;
    state
        .cache
        .invalidate_by_date_range(DateRange::single(report.date))
        .await;

    tracing::info!(
        "Report {} for {} on {} now has {} problem(s)",
        report.id,
        report.site_id,
        report.date,
        report.problems.len()
    );
    Ok(Json(ApiResponse::ok(report).with_message("Report saved")))
}

/// `GET /api/sla/reports?startDate&endDate[&siteId]`
async fn list_reports(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
    Query(filter): Query<SiteFilter>,
) -> SlaResult<Json<ApiResponse<Vec<SlaReport>>>> {
    // ---
    let site_id = filter.site_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let reports = state.store.fetch_reports(query.range()?, site_id).await?;
    Ok(Json(ApiResponse::ok(reports)))
}

/// `PUT /api/sla/reports/problems/{id}`
async fn update_problem(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ProblemUpdate>,
) -> SlaResult<Json<ApiResponse<SlaReportProblem>>> {
    // ---
    if body
        .description
        .as_deref()
        .is_some_and(|d| d.trim().is_empty())
    {
        return Err(SlaError::validation("description must not be empty"));
    }

    let (date, problem) = state
        .store
        .update_problem(id, &body)
        .await?
        .ok_or_else(|| SlaError::not_found(format!("Problem {id} not found")))?;

    state.cache.invalidate_by_date_range(DateRange::single(date)).await;
    Ok(Json(ApiResponse::ok(problem)))
}

/// `DELETE /api/sla/reports/problems/{id}`
async fn delete_problem(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> SlaResult<Json<ApiResponse<i64>>> {
    // ---
    let date = state
        .store
        .delete_problem(id)
        .await?
        .ok_or_else(|| SlaError::not_found(format!("Problem {id} not found")))?;

    state.cache.invalidate_by_date_range(DateRange::single(date)).await;
    Ok(Json(ApiResponse::ok(id).with_message("Problem deleted")))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sla/reports", get(list_reports).post(create_report))
        .route(
            "/api/sla/reports/problems/{id}",
            put(update_problem).delete(delete_problem),
        )
}
