//! Multipart spreadsheet upload endpoints.
//!
//! Every part carrying a file name is treated as one spreadsheet; other parts
//! are ignored. `/preview` classifies rows without writing anything.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use axum::{Json, Router};

use super::AppState;
use crate::error::{SlaError, SlaResult};
use crate::loader::{UploadFile, UploadOutcome, UploadPreview};
use crate::models::ApiResponse;

// ---

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

async fn read_files(mut multipart: Multipart) -> SlaResult<Vec<UploadFile>> {
    // ---
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SlaError::validation(format!("Failed to read multipart data: {e}")))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| SlaError::validation(format!("Failed to read file {file_name}: {e}")))?;

        tracing::debug!("Received upload part '{}' ({} bytes)", file_name, bytes.len());
        files.push(UploadFile {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
    Ok(files)
}

/// `POST /api/sla/upload`
async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> SlaResult<Json<ApiResponse<UploadOutcome>>> {
    // ---
    let files = read_files(multipart).await?;
    let outcome = state.loader.upload(files).await?;

    let message = format!(
        "Inserted {} row(s), skipped {}",
        outcome.commit.inserted, outcome.commit.skipped
    );
    tracing::info!("Upload batch {}: {}", outcome.commit.batch_id, message);
    Ok(Json(ApiResponse::ok(outcome).with_message(message)))
}

/// `POST /api/sla/upload/preview`
async fn preview(
    State(state): State<AppState>,
    multipart: Multipart,
) -> SlaResult<Json<ApiResponse<UploadPreview>>> {
    let files = read_files(multipart).await?;
    let preview = state.loader.preview_files(files).await?;
    Ok(Json(ApiResponse::ok(preview)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sla/upload", post(upload))
        .route("/api/sla/upload/preview", post(preview))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
