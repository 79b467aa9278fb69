//! Server-Sent Events for detection progress
//!
//! Emits the current DisplayState on connect, then one `state` event per
//! change. Heartbeats keep idle connections open.

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use hiomi_common::sse::with_heartbeat;
use std::convert::Infallible;
use tracing::{debug, info, warn};

/// GET /api/detect/events
pub async fn detection_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to detection events");

    let mut rx = state.reconciler.subscribe();

    let stream = async_stream::stream! {
        loop {
            let current = rx.borrow_and_update().clone();
            match serde_json::to_string(&current) {
                Ok(json) => {
                    debug!("SSE: Sending detection state");
                    yield Ok(Event::default().event("state").data(json));
                }
                Err(e) => warn!("SSE: Failed to serialize detection state: {}", e),
            }

            if rx.changed().await.is_err() {
                break;
            }
        }
    };

    with_heartbeat(stream)
}
