//! # Hiomi Common Library
//!
//! Shared code for the Hiomi pneumonia-detection services including:
//! - Inference result data model and validation
//! - Configuration resolution (environment, TOML, built-in defaults)
//! - Server-Sent Events helpers (server heartbeat stream, client frame decoder)
//! - Common error type

pub mod config;
pub mod error;
pub mod result;
pub mod sse;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use result::{InferenceResult, PendingRequest, Prediction, Probabilities, ResultEnvelope};
