//! Detection session API
//!
//! A single detection is in flight per service instance. Submitting a new
//! image cancels the previous one before uploading. A submission whose
//! upload finishes after a cancel or a newer submission is answered with 409
//! and never starts waiting.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use hiomi_client::{DisplayState, UploadFile};
use hiomi_common::PendingRequest;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Multipart field carrying the image
const IMAGE_FIELD: &str = "image";

/// Response for an accepted submission
#[derive(Debug, Serialize)]
pub struct DetectionAccepted {
    pub session_id: Uuid,
    pub pending: PendingRequest,
    /// Upload service status code
    pub upload_status: u16,
    /// Upload acknowledgement text
    pub message: String,
}

struct DetectionForm {
    image: UploadFile,
    model: Option<String>,
    user_id: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> ApiResult<DetectionForm> {
    let mut image = None;
    let mut model = None;
    let mut user_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            IMAGE_FIELD => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("image field has no filename".to_string()))?;
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                image = Some(UploadFile::new(filename, content_type, bytes.to_vec()));
            }
            "model" | "userId" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                if name == "model" {
                    model = value;
                } else {
                    user_id = value;
                }
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("missing image field".to_string()))?;
    Ok(DetectionForm {
        image,
        model,
        user_id,
    })
}

/// POST /api/detect
///
/// Validates and uploads the image, then waits for its result. Progress is
/// observable through `/api/detect/state` and `/api/detect/events`.
pub async fn start_detection(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<DetectionAccepted>)> {
    let form = read_form(multipart).await?;
    let config = state.config();
    let model = form.model.unwrap_or_else(|| config.default_model.clone());
    let user_id = form.user_id.unwrap_or_else(|| config.default_user_id.clone());

    let uploader = state.client.uploader();
    uploader.check(&form.image)?;

    let reservation = state.reconciler.begin().await;

    let session_id = Uuid::new_v4();
    info!(%session_id, filename = %form.image.filename, %model, %user_id, "Detection submitted");

    let ack = uploader.upload(form.image, &model, &user_id).await?;
    if !state
        .reconciler
        .start_waiting_if(reservation, ack.pending.clone())
        .await
    {
        warn!(%session_id, pending = %ack.pending, "Detection superseded during upload");
        return Err(ApiError::Conflict(
            "Detection was cancelled or replaced while uploading".to_string(),
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(DetectionAccepted {
            session_id,
            pending: ack.pending,
            upload_status: ack.status,
            message: ack.message,
        }),
    ))
}

/// DELETE /api/detect
pub async fn cancel_detection(State(state): State<AppState>) -> StatusCode {
    if state.reconciler.cancel().await {
        info!("Detection cancelled");
    }
    StatusCode::NO_CONTENT
}

/// GET /api/detect/state
pub async fn detection_state(State(state): State<AppState>) -> Json<DisplayState> {
    Json(state.reconciler.state())
}
