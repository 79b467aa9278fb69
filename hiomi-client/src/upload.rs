//! Upload Transport
//!
//! One multipart `POST {upload_url}/upload` per call carrying the file and
//! two string fields (`model`, `userId`). No retries. A successful upload
//! only means the file was accepted for asynchronous processing; the result
//! arrives through the Result Channel.

use crate::error::{ClientError, ClientResult};
use hiomi_common::config::UploadPolicy;
use hiomi_common::PendingRequest;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Multipart field names
pub const FILE_FIELD: &str = "file";
pub const MODEL_FIELD: &str = "model";
pub const USER_FIELD: &str = "userId";

/// A user-selected file, treated as opaque bytes
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Multipart part carrying the file bytes, name and type
    pub(crate) fn into_part(self) -> ClientResult<Part> {
        let part = Part::bytes(self.bytes).file_name(self.filename);
        match self.content_type {
            Some(mime) => part
                .mime_str(&mime)
                .map_err(|e| ClientError::RejectedFile(format!("invalid content type {mime:?}: {e}"))),
            None => Ok(part),
        }
    }
}

/// Structured acknowledgement, when the upload service answers in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
    pub user_id: String,
    pub size: u64,
}

/// Upload acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadAck {
    pub status: u16,
    /// Response body exactly as received
    pub message: String,
    /// Parsed body, if it was a JSON acknowledgement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<UploadResponse>,
    /// The request to wait for
    pub pending: PendingRequest,
}

/// Upload Transport
#[derive(Clone)]
pub struct UploadTransport {
    http: reqwest::Client,
    endpoint: String,
    policy: UploadPolicy,
}

impl UploadTransport {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, policy: UploadPolicy) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Check size, extension and type without touching the network
    pub fn check(&self, file: &UploadFile) -> ClientResult<()> {
        self.policy
            .check(&file.filename, file.content_type.as_deref(), file.size())
            .map_err(|e| ClientError::RejectedFile(e.to_string()))
    }

    /// Send `file` with its model and user fields
    pub async fn upload(&self, file: UploadFile, model: &str, user_id: &str) -> ClientResult<UploadAck> {
        self.check(&file)?;

        let pending = PendingRequest::new(user_id, file.filename.clone());
        let size = file.size();

        let form = Form::new()
            .part(FILE_FIELD, file.into_part()?)
            .text(MODEL_FIELD, model.to_string())
            .text(USER_FIELD, user_id.to_string());

        info!(%pending, size, model, "Uploading file");

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                error!(%pending, error = %e, "Upload request failed");
                ClientError::network("upload", e)
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::network("upload", e))?;

        if !status.is_success() {
            error!(%pending, status = status.as_u16(), body = %body, "Upload rejected");
            return Err(ClientError::Status {
                operation: "Upload",
                status: status.as_u16(),
                body,
            });
        }

        info!(%pending, status = status.as_u16(), "Upload accepted");

        Ok(UploadAck {
            status: status.as_u16(),
            response: serde_json::from_str(&body).ok(),
            message: body,
            pending,
        })
    }
}
