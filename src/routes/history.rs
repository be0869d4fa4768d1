//! Dated notes on known external outages (`history_gamas`).

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;

use super::AppState;
use crate::error::{SlaError, SlaResult};
use crate::models::{parse_iso_date, ApiResponse, DateRange, HistoryGamas};

// ---

#[derive(Debug, Deserialize)]
struct HistoryBody {
    date: NaiveDate,
    description: String,
}

impl HistoryBody {
    fn description(&self) -> SlaResult<&str> {
        let text = self.description.trim();
        if text.is_empty() {
            return Err(SlaError::validation("description must not be empty"));
        }
        Ok(text)
    }
}

/// Both bounds, neither, or a start date alone for a single day.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionalRange {
    start_date: Option<String>,
    end_date: Option<String>,
}

impl OptionalRange {
    fn range(&self) -> SlaResult<Option<DateRange>> {
        // ---
        match (self.start_date.as_deref(), self.end_date.as_deref()) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => DateRange::parse(start, end).map(Some),
            (Some(start), None) => {
                let start = parse_iso_date("startDate", start)?;
                Ok(Some(DateRange::single(start)))
            }
            (None, Some(_)) => Err(SlaError::validation("endDate requires startDate")),
        }
    }
}

/// `GET /api/history-gamas[?startDate&endDate]`
async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<OptionalRange>,
) -> SlaResult<Json<ApiResponse<Vec<HistoryGamas>>>> {
    // ---
    let rows = state.catalog.list_history(query.range()?).await?;
    Ok(Json(ApiResponse::ok(rows)))
}

async fn create_history(
    State(state): State<AppState>,
    Json(body): Json<HistoryBody>,
) -> SlaResult<Json<ApiResponse<HistoryGamas>>> {
    // ---
    let row = state
        .catalog
        .create_history(body.date, body.description()?)
        .await?;
    Ok(Json(ApiResponse::ok(row).with_message("History entry created")))
}

async fn update_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<HistoryBody>,
) -> SlaResult<Json<ApiResponse<HistoryGamas>>> {
    // ---
    let row = state
        .catalog
        .update_history(id, body.date, body.description()?)
        .await?
        .ok_or_else(|| SlaError::not_found(format!("History entry {id} not found")))?;
    Ok(Json(ApiResponse::ok(row)))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> SlaResult<Json<ApiResponse<i64>>> {
    // ---
    if !state.catalog.delete_history(id).await? {
        return Err(SlaError::not_found(format!("History entry {id} not found")));
    }
    Ok(Json(ApiResponse::ok(id)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/history-gamas", get(list_history).post(create_history))
        .route(
            "/api/history-gamas/{id}",
            put(update_history).delete(delete_history),
        )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn query(start: Option<&str>, end: Option<&str>) -> OptionalRange {
        OptionalRange {
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
        }
    }

    #[test]
    fn optional_range_forms() {
        // ---
        assert_eq!(query(None, None).range().unwrap(), None);

        let day = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        assert_eq!(
            query(Some("2025-03-04"), None).range().unwrap(),
            Some(DateRange::single(day))
        );
        assert!(query(None, Some("2025-03-04")).range().is_err());
        assert!(query(Some("2025-03-05"), Some("2025-03-04")).range().is_err());
    }
}
