//! hiomi-web - pneumonia detection demo service
//!
//! Inference proxy plus a detection session API backed by the result
//! delivery client. Configured from the environment (optionally a TOML file
//! named by `HIOMI_CONFIG`).

use anyhow::{Context, Result};
use hiomi_client::HiomiClient;
use hiomi_common::ServiceConfig;
use hiomi_web::{build_router, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing before anything else; RUST_LOG wins over the
    // configured level, which is applied once the configuration is known
    let env_filter = EnvFilter::try_from_default_env().ok();
    let initial = env_filter.is_some();
    let (filter, reload_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    info!(
        "Starting Hiomi web service (hiomi-web) v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    if !initial {
        match EnvFilter::try_new(&config.logging.level) {
            Ok(filter) => {
                if let Err(e) = reload_handle.reload(filter) {
                    warn!("Failed to apply log level {}: {}", config.logging.level, e);
                }
            }
            Err(e) => warn!("Ignoring invalid log level {:?}: {}", config.logging.level, e),
        }
    }

    info!("Inference backend: {}", config.api_url);
    info!("Upload service: {}", config.upload_url);
    info!(
        "Result service: {} (push {})",
        config.result_url,
        if config.result_push { "enabled" } else { "disabled" }
    );

    let bind_addr = config.bind_addr.clone();
    let client = HiomiClient::new(config).context("building HTTP client")?;
    let app = build_router(AppState::new(client));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!("hiomi-web listening on http://{}", bind_addr);
    info!("Health check: http://{}/health", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
