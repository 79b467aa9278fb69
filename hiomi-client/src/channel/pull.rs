//! Pull mechanism: fixed-interval polling of `{result_url}/results`
//!
//! The first fetch is issued immediately, then one per interval until a
//! payload is accepted, the request goes stale, or the attempt ceiling is
//! reached. A missing result (404) or a failed fetch is the expected steady
//! state and only logged; exhaustion is the one surfaced error.

use super::{Acceptance, ResultFetcher};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use hiomi_common::{InferenceResult, PendingRequest, ServiceConfig};
use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.poll_interval, config.poll_max_attempts)
    }
}

impl Default for PollSettings {
    /// 2 s interval, 30 attempts (about a minute)
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 30)
    }
}

/// How a polling run ended, other than by exhaustion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A payload was accepted on this attempt (1-based)
    Accepted { attempt: u32 },
    /// Cancelled, or the request went stale
    Stopped,
}

/// HTTP fetcher for `GET {result_url}/results?userId=..&filename=..`
#[derive(Clone)]
pub struct HttpResultFetcher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpResultFetcher {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ResultFetcher for HttpResultFetcher {
    async fn fetch(&self, pending: &PendingRequest) -> ClientResult<Option<InferenceResult>> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("userId", pending.user_id.as_str()), ("filename", pending.filename.as_str())])
            .send()
            .await
            .map_err(|e| ClientError::network("result", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::network("result", e))?;

        if !status.is_success() {
            return Err(ClientError::Status {
                operation: "Result fetch",
                status: status.as_u16(),
                body,
            });
        }

        InferenceResult::from_json(&body)
            .map(Some)
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }
}

/// Fixed-interval poller
pub struct Poller {
    fetcher: Arc<dyn ResultFetcher>,
    settings: PollSettings,
}

impl Poller {
    pub fn new(fetcher: Arc<dyn ResultFetcher>, settings: PollSettings) -> Self {
        Self { fetcher, settings }
    }

    /// Poll until `accept` takes a payload, `cancel` fires, or attempts run out
    ///
    /// Never issues more than `max_attempts` fetches. Consecutive fetches are
    /// at least `interval` apart.
    pub async fn run<A, Fut>(
        &self,
        pending: &PendingRequest,
        cancel: &CancellationToken,
        mut accept: A,
    ) -> ClientResult<PollOutcome>
    where
        A: FnMut(InferenceResult) -> Fut,
        Fut: Future<Output = Acceptance>,
    {
        let PollSettings {
            interval,
            max_attempts,
        } = self.settings;

        info!(%pending, ?interval, max_attempts, "Polling for result");

        for attempt in 1..=max_attempts {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Ok(PollOutcome::Stopped),
                fetched = self.fetcher.fetch(pending) => fetched,
            };

            match fetched {
                Ok(Some(result)) => match accept(result).await {
                    Acceptance::Accepted => {
                        info!(%pending, attempt, "Result received via polling");
                        return Ok(PollOutcome::Accepted { attempt });
                    }
                    Acceptance::Stale => return Ok(PollOutcome::Stopped),
                    Acceptance::Ignored => {
                        debug!(%pending, attempt, "Polled result belongs to another request");
                    }
                },
                Ok(None) => debug!(%pending, attempt, "Result not ready"),
                Err(e) => debug!(%pending, attempt, error = %e, "Polling attempt failed"),
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(PollOutcome::Stopped),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        warn!(%pending, attempts = max_attempts, "Polling exhausted");
        Err(ClientError::Timeout {
            attempts: max_attempts,
        })
    }
}
