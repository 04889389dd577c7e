use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::admin_auth_middleware;
use crate::state::AppState;

/// Create the main application router with all routes and middleware
#[tracing::instrument(skip(state))]
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes; the WebSocket endpoint authenticates with its query token
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ws", get(handlers::ws::ws_handler));

    // Administrative routes (admin permission required)
    let admin_routes = Router::new()
        .route(
            "/api/scheduler/status",
            get(handlers::scheduler::scheduler_status),
        )
        .route(
            "/api/scheduler/jobs/:id",
            get(handlers::scheduler::job_info),
        )
        .route(
            "/api/tasks",
            get(handlers::tasks::list_tasks).post(handlers::tasks::create_task),
        )
        .route(
            "/api/tasks/:id",
            get(handlers::tasks::get_task)
                .put(handlers::tasks::update_task)
                .delete(handlers::tasks::delete_task),
        )
        .route("/api/tasks/:id/pause", post(handlers::tasks::pause_task))
        .route("/api/tasks/:id/resume", post(handlers::tasks::resume_task))
        .route("/api/tasks/:id/run", post(handlers::tasks::run_task))
        .route(
            "/api/channels/:channel/publish",
            post(handlers::channels::publish_to_channel),
        )
        .route(
            "/api/channels/:channel/subscribers",
            get(handlers::channels::channel_subscribers),
        )
        .route(
            "/api/notifications/:identity",
            post(handlers::channels::notify_identity),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    // Metrics endpoint (no authentication for Prometheus scraping)
    let metrics_routes = Router::new().route("/metrics", get(handlers::metrics::metrics_handler));

    // Combine all routes
    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .merge(metrics_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
