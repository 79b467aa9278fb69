//! Client facade built from an explicit [`ServiceConfig`]

use crate::channel::{HttpResultFetcher, PollSettings, PushChannel, ResultFetcher, SsePushChannel};
use crate::diagnostics::ConnectionDiagnostics;
use crate::error::{ClientError, ClientResult};
use crate::processing::ImageProcessor;
use crate::reconciler::Reconciler;
use crate::upload::UploadTransport;
use hiomi_common::ServiceConfig;
use std::sync::Arc;
use tracing::info;

/// Hiomi service client
///
/// Holds two HTTP clients: one with the configured total timeout for
/// request/response calls, and one limited to a connect timeout for the
/// long-lived result stream.
#[derive(Clone)]
pub struct HiomiClient {
    config: ServiceConfig,
    http: reqwest::Client,
    streaming: reqwest::Client,
}

impl HiomiClient {
    pub fn new(config: ServiceConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ClientError::network("http", e))?;

        let streaming = reqwest::Client::builder()
            .connect_timeout(config.http_timeout)
            .build()
            .map_err(|e| ClientError::network("http", e))?;

        info!(
            upload_url = %config.upload_url,
            result_url = %config.result_url,
            result_push = config.result_push,
            "Hiomi client initialized"
        );

        Ok(Self {
            config,
            http,
            streaming,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Shared request/response client (total timeout applied)
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn uploader(&self) -> UploadTransport {
        UploadTransport::new(
            self.http.clone(),
            self.config.upload_endpoint(),
            self.config.upload.clone(),
        )
    }

    pub fn push_channel(&self) -> SsePushChannel {
        SsePushChannel::new(
            self.streaming.clone(),
            self.config.stream_endpoint(),
            self.config.result_event.clone(),
        )
    }

    pub fn result_fetcher(&self) -> HttpResultFetcher {
        HttpResultFetcher::new(self.http.clone(), self.config.results_endpoint())
    }

    /// New reconciler wired to this client's channels
    ///
    /// With `result_push` disabled the reconciler polls from the start.
    pub fn reconciler(&self) -> Reconciler {
        let push: Option<Arc<dyn PushChannel>> = if self.config.result_push {
            Some(Arc::new(self.push_channel()))
        } else {
            None
        };
        let fetcher: Arc<dyn ResultFetcher> = Arc::new(self.result_fetcher());
        Reconciler::new(push, fetcher, PollSettings::from_config(&self.config))
    }

    /// Processor for the proxy route served at `app_url`
    pub fn processor(&self, app_url: &str) -> ImageProcessor {
        ImageProcessor::new(self.http.clone(), app_url)
    }

    pub fn diagnostics(&self, app_url: &str) -> ConnectionDiagnostics {
        ConnectionDiagnostics::new(self.http.clone(), self.processor(app_url))
    }
}
