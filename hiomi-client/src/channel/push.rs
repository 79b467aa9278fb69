//! Push mechanism: SSE subscription to `{result_url}/stream`
//!
//! Events named after the configured result event carry the result envelope
//! as JSON. Other events and heartbeat comments are skipped. Malformed
//! payloads are reported as [`ChannelSignal::Malformed`] and never end the
//! subscription; transport failures and end of stream do. Events larger than
//! [`MAX_EVENT_BYTES`] are dropped and reported as malformed.

use super::{ChannelSignal, PushChannel, Subscription};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use futures::StreamExt;
use hiomi_common::sse::{SseDecoder, MAX_EVENT_BYTES};
use hiomi_common::InferenceResult;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// SSE push channel
#[derive(Clone)]
pub struct SsePushChannel {
    http: reqwest::Client,
    endpoint: String,
    event_name: String,
}

impl SsePushChannel {
    /// `http` must not carry a total request timeout, or the stream would be
    /// cut off after it elapses.
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            event_name: event_name.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PushChannel for SsePushChannel {
    async fn subscribe(
        &self,
        signals: mpsc::Sender<ChannelSignal>,
        cancel: CancellationToken,
    ) -> ClientResult<Subscription> {
        debug!(url = %self.endpoint, "Opening result stream");

        let response = self
            .http
            .get(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::network("result", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Result stream refused");
            return Err(ClientError::Status {
                operation: "Result stream",
                status: status.as_u16(),
                body,
            });
        }

        info!(url = %self.endpoint, "Result stream connected");

        let event_name = self.event_name.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut body = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::new();

            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = body.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            if frame.event != event_name {
                                trace!(event = %frame.event, "Skipping stream event");
                                continue;
                            }

                            let signal = match InferenceResult::from_json(&frame.data) {
                                Ok(result) => ChannelSignal::Result(result),
                                Err(e) => ChannelSignal::Malformed(e.to_string()),
                            };

                            if signals.send(signal).await.is_err() {
                                debug!("Result stream receiver gone");
                                return;
                            }
                        }

                        let dropped = decoder.take_discarded();
                        if dropped > 0 {
                            warn!(dropped, limit = MAX_EVENT_BYTES, "Dropping oversized stream event");
                            let signal =
                                ChannelSignal::Malformed(format!("event exceeded {MAX_EVENT_BYTES} bytes"));
                            if signals.send(signal).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = signals
                            .send(ChannelSignal::Error(ClientError::network("result", e)))
                            .await;
                        break;
                    }
                    None => {
                        let _ = signals.send(ChannelSignal::Error(ClientError::ChannelClosed)).await;
                        break;
                    }
                }
            }

            debug!("Result stream reader stopped");
        });

        Ok(Subscription::new(cancel, "push"))
    }
}
