use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::broadcast::SubscriberHealth;
use common::models::SchedulerState;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscriber: SubscriberHealth,
    pub connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<&'static str>,
}

/// Health check endpoint
///
/// Unhealthy (503) while the bus subscriber is enabled but disconnected, or
/// when the scheduler's database does not answer.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let subscriber = state.bus.health();
    let mut healthy = subscriber.is_healthy();

    let database = match &state.db_pool {
        Some(pool) => match pool.health_check().await {
            Ok(()) => Some("ok"),
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                healthy = false;
                Some("unavailable")
            }
        },
        None => None,
    };

    let scheduler = match &state.scheduler {
        Some(scheduler) => Some(scheduler.get_status().await.status),
        None => None,
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        subscriber,
        connections: state.connections.connection_count().await,
        scheduler,
        database,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
