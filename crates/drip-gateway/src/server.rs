//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{delete, get, post},
};
use drip_core::config::GatewayConfig;
use drip_scheduler::ProcessRegistry;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProcessRegistry>,
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/subscribe", post(super::routes::subscribe))
        .route("/get_details", get(super::routes::get_details))
        .route("/unsubscribe", delete(super::routes::unsubscribe))
        .route("/health", get(super::routes::health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves; in-flight requests finish first.
pub async fn start_server(
    config: &GatewayConfig,
    registry: Arc<ProcessRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        registry,
        gateway_config: config.clone(),
        start_time: std::time::Instant::now(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("🌐 Gateway server stopped");
    Ok(())
}
