pub mod error;
pub mod handler;
pub mod models;
pub mod streaming;
pub mod translation;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Json;
use axum::Router as AxumRouter;
use serde_json::json;

use crate::config::RelayConfig;
use crate::plugins::{builtin, PluginRegistry};
use crate::providers::Registry;
use crate::proxy::error::RelayError;
use crate::router::Router;

/// Shared per-process state. Configuration and the provider registry are
/// immutable after startup; the plugin registry takes a read lock per
/// request.
pub struct ProxyState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
    pub router: Router,
    pub plugins: Arc<PluginRegistry>,
    pub http_client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: RelayConfig) -> std::result::Result<Self, RelayError> {
        config.validate()?;

        let registry = Arc::new(Registry::from_config(&config.providers));
        let router = Router::new(config.router.clone());

        let plugins = Arc::new(PluginRegistry::new());
        builtin::register_builtins(&plugins, &config.plugins);

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            registry,
            router,
            plugins,
            http_client,
        })
    }
}

/// The inbound HTTP surface.
pub fn build_app(state: Arc<ProxyState>) -> AxumRouter {
    let body_limit = state.config.max_body_bytes;
    AxumRouter::new()
        .route("/v1/messages", post(handler::handle_messages))
        .route("/v1/models", get(models::list_models))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .layer(DefaultBodyLimit::max(body_limit + 1024))
        .with_state(state)
}

pub async fn start_proxy(config: RelayConfig, port_override: Option<u16>) -> Result<()> {
    let port = port_override.unwrap_or(config.port);
    let host = config.host.clone();

    let state = Arc::new(ProxyState::new(config)?);
    let app = build_app(state);

    let bind_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!("relay listening on {bind_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
