//! API server.

use axum::{Router, middleware};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::middleware::AdminAuth;
use crate::api::middleware::auth::require_signed;
use crate::api::routes;
use crate::config::ApiConfig;
use crate::engine::JobEngine;
use crate::{Error, Result};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
    cancel: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiConfig, engine: Arc<JobEngine>) -> Self {
        Self {
            config,
            state: AppState { engine },
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Assemble the router: a public health check plus the guarded engine
    /// control surface.
    pub fn build_router(&self) -> Router {
        let auth = AdminAuth::new(&self.config);

        let engine_routes = routes::jobs::router()
            .layer(middleware::from_fn_with_state(auth, require_signed));

        Router::new()
            .merge(routes::health::router())
            .nest("/api/engine", engine_routes)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until the cancel token fires.
    pub async fn serve(&self) -> Result<()> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                Error::config(format!("cannot bind {}: {e}", self.config.bind_addr))
            })?;

        info!(addr = %self.config.bind_addr, "API server listening");

        let cancel = self.cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("API server stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
