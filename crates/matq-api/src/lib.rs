pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Routes under `/api`, without a listener. Split out so tests can drive it.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/queues", get(handlers::handle_queues))
        .route(
            "/runs",
            get(handlers::handle_runs)
                .post(handlers::handle_submit_run)
                .layer(DefaultBodyLimit::max(64 * 1024 * 1024)),
        )
        .route("/runs/{id}", get(handlers::handle_run_inspect))
        .route("/runs/{id}/cancel", post(handlers::handle_run_cancel))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
