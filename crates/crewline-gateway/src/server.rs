use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::routes;
use crate::state::AppState;

/// Route table shared by the server and the tests.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Stateless graph operations
        .route("/api/pipelines/validate", post(routes::validate))
        .route("/api/pipelines/graph", post(routes::to_graph))
        .route("/api/pipelines/stages", post(routes::to_stages))
        .route("/api/pipelines/layout", post(routes::layout))
        // Team pipelines
        .route(
            "/api/teams/{team}/pipelines",
            put(routes::save_pipeline).get(routes::list_pipelines),
        )
        .route(
            "/api/teams/{team}/pipelines/{id}/activate",
            post(routes::activate_pipeline),
        )
        .route("/api/teams/{team}/pipeline", get(routes::active_pipeline))
        // Editor sessions
        .route(
            "/api/teams/{team}/pipelines/{id}/edits",
            post(routes::edit_pipeline),
        )
        .route(
            "/api/teams/{team}/pipelines/{id}/flush",
            post(routes::flush_pipeline),
        )
        // Mission executions
        .route(
            "/api/missions/{mission}/execution",
            post(routes::create_execution).get(routes::get_execution),
        )
        .route("/api/missions/{mission}/events", post(routes::apply_event))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = build_router(self.state.clone());

        let bind = self.state.config.bind.clone();
        let listener = TcpListener::bind(&bind).await?;
        info!(bind = %bind, auth = self.state.config.token.is_some(), "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        // Stop the debounce loops and write out pending edits
        self.state.shutdown.cancel();
        for (pipeline_id, session) in self.state.editors.lock().await.iter() {
            if let Err(e) = session.flush() {
                warn!(pipeline_id = %pipeline_id, error = %e, "Editor flush on shutdown failed");
            }
        }

        info!("Gateway shut down");
        Ok(())
    }
}
