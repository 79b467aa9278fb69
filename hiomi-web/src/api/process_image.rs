//! Inference proxy
//!
//! `POST /api/process_image` rebuilds the incoming multipart body and forwards
//! it to `{api_url}/process_image`. A backend error comes back as the
//! backend's raw body with the same status; anything that goes wrong
//! inside the proxy itself is a plain 500 "Internal Server Error".

use crate::AppState;
use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reqwest::multipart::{Form, Part};
use tracing::{error, info, warn};

/// POST /api/process_image
pub async fn process_image(State(state): State<AppState>, multipart: Multipart) -> Response {
    match forward(&state, multipart).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Error in process_image proxy");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

async fn forward(state: &AppState, multipart: Multipart) -> Result<Response> {
    let form = rebuild_form(multipart).await?;
    let endpoint = state.config().process_endpoint();

    info!(endpoint = %endpoint, "Forwarding image to inference backend");

    let response = state
        .client
        .http()
        .post(&endpoint)
        .multipart(form)
        .send()
        .await
        .context("inference backend request failed")?;

    let status = response.status().as_u16();
    let body = response.text().await.context("reading inference backend response")?;

    if !(200..300).contains(&status) {
        warn!(status, body = %body, "Inference backend returned an error");
        let status = StatusCode::from_u16(status)?;
        return Ok((status, body).into_response());
    }

    let data: serde_json::Value =
        serde_json::from_str(&body).context("inference backend returned invalid JSON")?;
    Ok(Json(data).into_response())
}

/// Copy every field into an outgoing form, keeping file names and types
async fn rebuild_form(mut multipart: Multipart) -> Result<Form> {
    let mut form = Form::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field
            .name()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("multipart field without a name"))?;
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        form = match file_name {
            Some(file_name) => {
                let mut part = Part::bytes(bytes.to_vec()).file_name(file_name);
                if let Some(content_type) = content_type {
                    part = part.mime_str(&content_type)?;
                }
                form.part(name, part)
            }
            None => form.text(name, String::from_utf8_lossy(&bytes).into_owned()),
        };
    }

    Ok(form)
}
