use std::sync::Arc;
use std::time::Duration;

use formflow::api::ApiServer;
use formflow::config::{ApiConfig, EngineConfig};
use formflow::database::{self, repositories::SqlxJobRepository};
use formflow::engine::JobEngine;
use formflow::engine::handlers::{
    AiGenerationHandler, DocumentRenderHandler, HandlerRegistry, HttpAiProvider,
    HttpDocumentRenderer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    formflow::logging::init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let engine_config = EngineConfig::from_env();
    let api_config = ApiConfig::from_env();

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:formflow.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let repo = Arc::new(SqlxJobRepository::new(pool));

    // Execution collaborators. The per-call timeout stays under the handler
    // timeout so transport errors surface before the executor gives up.
    let call_timeout = Duration::from_secs(engine_config.handler_timeout_secs.saturating_sub(5));
    let ai_provider = Arc::new(HttpAiProvider::new(
        std::env::var("FORMFLOW_AI_ENDPOINT")
            .unwrap_or_else(|_| "http://127.0.0.1:9200/v1/generate".to_string()),
        std::env::var("FORMFLOW_AI_API_KEY").unwrap_or_default(),
    ));
    let renderer = Arc::new(HttpDocumentRenderer::new(
        std::env::var("FORMFLOW_RENDERER_ENDPOINT")
            .unwrap_or_else(|_| "http://127.0.0.1:9300/render".to_string()),
    ));

    let registry = HandlerRegistry::new()
        .with_handler(Arc::new(AiGenerationHandler::new(ai_provider, call_timeout)))
        .with_handler(Arc::new(DocumentRenderHandler::new(renderer, call_timeout)));

    let engine = Arc::new(JobEngine::new(engine_config, repo, registry)?);

    // Anything left PROCESSING by a previous run is orphaned.
    engine.recover_interrupted().await?;
    engine.start();

    let server = ApiServer::new(api_config, engine.clone());
    let server_cancel = server.cancel_token();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        server_cancel.cancel();
    });

    server.serve().await?;
    engine.shutdown().await;

    Ok(())
}
