//! Image processing through the same-origin inference proxy
//!
//! `POST {app_url}/api/process_image` with multipart fields `image` and
//! `model`. The proxy answers with the backend's JSON (`{"text": ...}`) or the
//! backend's raw error body and status.

use crate::error::{ClientError, ClientResult};
use crate::upload::UploadFile;
use futures::future::join_all;
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const PROCESS_PATH: &str = "/api/process_image";

/// Prediction text returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedImage {
    pub text: String,
}

/// One entry of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPrediction {
    pub predictions: Vec<BatchEntry>,
}

/// Client for the inference proxy
#[derive(Clone)]
pub struct ImageProcessor {
    http: reqwest::Client,
    endpoint: String,
}

impl ImageProcessor {
    /// `app_url` is the origin serving the proxy route
    pub fn new(http: reqwest::Client, app_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}{}", app_url.trim_end_matches('/'), PROCESS_PATH),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn process_image(&self, file: UploadFile, model: &str) -> ClientResult<ProcessedImage> {
        info!(filename = %file.filename, size = file.size(), model, "Processing image");

        let form = Form::new()
            .part("image", file.into_part()?)
            .text("model", model.to_string());

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::network("processing", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::network("processing", e))?;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %body, "Processing failed");
            return Err(ClientError::Status {
                operation: "Processing",
                status: status.as_u16(),
                body,
            });
        }

        let processed: ProcessedImage =
            serde_json::from_str(&body).map_err(|e| ClientError::Malformed(e.to_string()))?;
        info!(text = %processed.text, "Processing successful");
        Ok(processed)
    }

    /// Process every file concurrently
    ///
    /// A failing file becomes an entry with `error` set; the batch as a whole
    /// always succeeds.
    pub async fn process_batch(&self, files: Vec<UploadFile>, model: &str) -> BatchPrediction {
        info!(count = files.len(), "Batch processing");

        let predictions = join_all(files.into_iter().map(|file| async move {
            let filename = file.filename.clone();
            match self.process_image(file, model).await {
                Ok(processed) => BatchEntry {
                    filename,
                    text: Some(processed.text),
                    error: None,
                },
                Err(e) => BatchEntry {
                    filename,
                    text: None,
                    error: Some(e.to_string()),
                },
            }
        }))
        .await;

        info!(count = predictions.len(), "Batch processing completed");
        BatchPrediction { predictions }
    }
}
