//! API server setup

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use repolens_core::db::Database;
use repolens_core::extract::PlanGenerator;
use repolens_core::queue::Processor;
use repolens_core::quota::QuotaResolver;
use repolens_core::Config;

use crate::handlers::{
    cancel_queue_item, create_implementation_plan, delete_implementation_plan, enqueue_analyses,
    get_project, get_usage, get_usage_by_depth, get_usage_by_model, health_check,
    process_queue_item, sync_subscription, toggle_implementation_item, ApiState,
};

/// Main API server
pub struct ApiServer {
    config: Config,
    state: Arc<ApiState>,
}

impl ApiServer {
    /// Create a new API server over an opened, migrated database
    pub fn new(config: Config, db: Arc<Database>) -> Self {
        let state = Arc::new(ApiState {
            processor: Arc::new(Processor::new(db.clone(), config.provider.clone())),
            generator: Arc::new(PlanGenerator::new(db.clone(), config.provider.clone())),
            resolver: QuotaResolver::new(db.clone()),
            db,
        });
        Self { config, state }
    }

    /// Build the application router for a state (exposed for tests)
    pub fn router(state: Arc<ApiState>) -> Router {
        Router::new()
            // Queue trigger + cancellation
            .route("/api/queue/:id/process", post(process_queue_item))
            .route("/api/queue/:id", delete(cancel_queue_item))
            // Projects
            .route("/api/projects/:id", get(get_project))
            .route("/api/projects/:id/enqueue", post(enqueue_analyses))
            // Implementation plans
            .route("/api/implementation-plans", post(create_implementation_plan))
            .route(
                "/api/implementation-plans/:id",
                delete(delete_implementation_plan),
            )
            .route(
                "/api/implementation-items/:id/toggle",
                post(toggle_implementation_item),
            )
            // Usage surface
            .route("/api/usage", get(get_usage))
            .route("/api/usage/models", get(get_usage_by_model))
            .route("/api/usage/depths", get(get_usage_by_depth))
            // Billing sync
            .route("/api/subscriptions/sync", post(sync_subscription))
            // Health check
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the API server
    pub async fn start(&self) -> Result<()> {
        let app = Self::router(self.state.clone());

        let host = self.config.server.host.as_str();
        let port = self.config.server.port;
        info!("Starting repolens API server on {}:{}", host, port);

        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        info!("repolens API server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("failed to run API server: {}", e))?;
        Ok(())
    }
}
