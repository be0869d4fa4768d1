//! Read endpoints for every aggregator operation.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::{AppState, RangeQuery};
use crate::aggregator::{
    ChartPoint, DailyDetailReport, MasterFilters, MasterRow, MonthlySummary, TelemetrySla,
    WeeklyPoint,
};
use crate::error::SlaResult;
use crate::models::{ApiResponse, BatteryVersion};

// ---

// Extra parameters are read by a second `Query` extractor over the same
// query string; `serde(flatten)` would lose numeric fields.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionQuery {
    battery_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteQuery {
    site_id: String,
}

/// `GET /api/sla/daily?startDate&endDate[&batteryVersion]`
async fn daily(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
    Query(version): Query<VersionQuery>,
) -> SlaResult<Json<ApiResponse<Vec<ChartPoint>>>> {
    // ---
    let range = query.range()?;
    let version = version
        .battery_version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
        .map(str::parse::<BatteryVersion>)
        .transpose()?;

    let series = match version {
        Some(version) => {
            state
                .aggregator
                .daily_chart_by_battery_version(range, version)
                .await?
        }
        None => state.aggregator.daily_chart_all_sites(range).await?,
    };
    Ok(Json(ApiResponse::ok(series)))
}

/// `GET /api/sla/weekly?startDate&endDate`
async fn weekly(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> SlaResult<Json<ApiResponse<Vec<WeeklyPoint>>>> {
    let series = state.aggregator.weekly_chart(query.range()?).await?;
    Ok(Json(ApiResponse::ok(series)))
}

/// `GET /api/sla/monthly?startDate&endDate`
async fn monthly(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> SlaResult<Json<ApiResponse<MonthlySummary>>> {
    let summary = state.aggregator.monthly_summary(query.range()?).await?;
    Ok(Json(ApiResponse::ok(summary)))
}

/// `GET /api/sla/detail?startDate&endDate` (endDate = startDate + 1 day)
async fn detail(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> SlaResult<Json<ApiResponse<DailyDetailReport>>> {
    let report = state.aggregator.daily_detail_report(query.range()?).await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// `GET /api/sla/master?startDate&endDate&...filters`
async fn master(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
    Query(filters): Query<MasterFilters>,
) -> SlaResult<Json<ApiResponse<Vec<MasterRow>>>> {
    // ---
    let page = state
        .aggregator
        .master(query.range()?, &filters)
        .await?;
    Ok(Json(ApiResponse::paginated(page.rows, page.pagination)))
}

/// `GET /api/sla/telemetry?siteId&startDate&endDate`
async fn telemetry(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
    Query(site): Query<SiteQuery>,
) -> SlaResult<Json<ApiResponse<TelemetrySla>>> {
    let sla = state
        .aggregator
        .site_telemetry_sla(&site.site_id, query.range()?)
        .await?;
    Ok(Json(ApiResponse::ok(sla)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sla/daily", get(daily))
        .route("/api/sla/weekly", get(weekly))
        .route("/api/sla/monthly", get(monthly))
        .route("/api/sla/detail", get(detail))
        .route("/api/sla/master", get(master))
        .route("/api/sla/telemetry", get(telemetry))
}
