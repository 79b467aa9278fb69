//! # Hiomi Client
//!
//! Result-delivery client for the pneumonia-detection demo:
//! - Upload Transport: one multipart upload per call
//! - Result Channel: SSE push subscription with a fixed-interval polling fallback
//! - Result Reconciler: first matching payload wins, exactly one terminal transition
//! - Image processing through the same-origin inference proxy
//! - Connection diagnostics (CORS preflight, test processing)
//!
//! Everything hangs off an explicit [`HiomiClient`] built from a
//! [`hiomi_common::ServiceConfig`].

pub mod channel;
pub mod client;
pub mod diagnostics;
pub mod error;
pub mod processing;
pub mod reconciler;
pub mod summary;
pub mod upload;

pub use crate::channel::{Acceptance, ChannelSignal, PollSettings, PushChannel, ResultFetcher, Subscription};
pub use crate::client::HiomiClient;
pub use crate::error::{ClientError, ClientResult};
pub use crate::reconciler::{DeliveryMode, DisplayState, Reconciler, Reservation};
pub use crate::summary::AnalysisSummary;
pub use crate::upload::{UploadAck, UploadFile, UploadTransport};
