//! HTTP API handlers for hiomi-web

pub mod detect;
pub mod health;
pub mod process_image;
pub mod sse;

pub use detect::{cancel_detection, detection_state, start_detection};
pub use health::health_routes;
pub use process_image::process_image;
pub use sse::detection_events;
