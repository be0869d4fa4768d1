//! `GET /api/telemetry/export?siteId&startDate&endDate`

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use super::{AppState, RangeQuery};
use crate::error::{SlaError, SlaResult};
use crate::export::telemetry_workbook;

// ---

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportQuery {
    site_id: String,
}

async fn export_telemetry(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
    Query(site): Query<ExportQuery>,
) -> SlaResult<impl IntoResponse> {
    // ---
    let site_id = site.site_id.trim();
    if site_id.is_empty() {
        return Err(SlaError::validation("siteId is required"));
    }
    let range = query.range()?;

    let records = state.store.fetch_intervals(site_id, range).await?;
    let bytes = telemetry_workbook(&records)?;
    tracing::info!(
        "Exported {} interval rows for {} over {}",
        records.len(),
        site_id,
        range
    );

    let file_name = format!(
        "telemetry_{}_{}_{}.xlsx",
        site_id.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "_"),
        range.start.format("%Y%m%d"),
        range.end.format("%Y%m%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_MIME.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/telemetry/export", get(export_telemetry))
}
