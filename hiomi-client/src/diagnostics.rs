//! Connectivity diagnostics
//!
//! A CORS preflight check against the inference proxy and a processing check
//! with a tiny built-in image. Both report instead of failing so they can be
//! shown on a status page as-is.

use crate::processing::{ImageProcessor, ProcessedImage};
use crate::upload::UploadFile;
use crate::error::ClientResult;
use reqwest::Method;
use serde::Serialize;
use tracing::{info, warn};

/// Origin presented by the preflight check
pub const PREFLIGHT_ORIGIN: &str = "http://localhost:3000";

/// 4x4 grayscale PNG used by the processing check
const SAMPLE_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x8c, 0x9a, 0xc1,
    0xa2, 0x00, 0x00, 0x00, 0x13, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8, 0x0f, 0x04, 0x0c,
    0xff, 0x19, 0x18, 0x60, 0x04, 0x10, 0x00, 0x00, 0x77, 0x9c, 0x0b, 0xf5, 0x24, 0x7e, 0x12, 0x7f,
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Preflight outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorsReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub allow_origin: Option<String>,
    pub allow_methods: Option<String>,
    pub allow_headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ConnectionDiagnostics {
    http: reqwest::Client,
    processor: ImageProcessor,
}

impl ConnectionDiagnostics {
    pub fn new(http: reqwest::Client, processor: ImageProcessor) -> Self {
        Self { http, processor }
    }

    /// Send an OPTIONS preflight for a multipart POST to the proxy route
    pub async fn test_cors(&self) -> CorsReport {
        let endpoint = self.processor.endpoint();
        info!(endpoint, "Testing CORS preflight");

        let response = self
            .http
            .request(Method::OPTIONS, endpoint)
            .header("Origin", PREFLIGHT_ORIGIN)
            .header("Access-Control-Request-Method", "POST")
            .header("Access-Control-Request-Headers", "Content-Type")
            .send()
            .await;

        match response {
            Ok(response) => {
                let header = |name: &str| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                let report = CorsReport {
                    ok: response.status().is_success(),
                    status: Some(response.status().as_u16()),
                    allow_origin: header("access-control-allow-origin"),
                    allow_methods: header("access-control-allow-methods"),
                    allow_headers: header("access-control-allow-headers"),
                    error: None,
                };
                info!(ok = report.ok, status = ?report.status, "CORS preflight finished");
                report
            }
            Err(e) => {
                warn!(error = %e, "CORS preflight failed");
                CorsReport {
                    ok: false,
                    status: None,
                    allow_origin: None,
                    allow_methods: None,
                    allow_headers: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Run the built-in test image through the processing route with model "1"
    pub async fn test_processing(&self) -> ClientResult<ProcessedImage> {
        let sample = UploadFile::new("test.png", Some("image/png".to_string()), SAMPLE_PNG.to_vec());
        self.processor.process_image(sample, "1").await
    }
}
