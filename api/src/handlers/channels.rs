use axum::{
    extract::{Path, State},
    Json,
};
use common::broadcast::PublishOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handlers::{ErrorResponse, SuccessResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub channel: String,
    /// `relay` when handed to the transport, `local` on fallback
    pub route: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SubscribersResponse {
    pub channel: String,
    pub subscribers: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub identity: String,
    pub delivered: bool,
}

fn require_name(kind: &str, value: &str) -> Result<(), ErrorResponse> {
    if value.trim().is_empty() {
        return Err(ErrorResponse::new(
            "validation_error",
            format!("{} must not be empty", kind),
        ));
    }
    Ok(())
}

/// Publish a payload to every subscriber of `channel` across all processes
#[tracing::instrument(skip(state, req))]
pub async fn publish_to_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<SuccessResponse<PublishResponse>, ErrorResponse> {
    require_name("channel", &channel)?;

    let response = match state.bus.publish(&channel, req.payload).await {
        PublishOutcome::Relayed => PublishResponse {
            channel,
            route: "relay",
            delivered: None,
        },
        PublishOutcome::LocalFallback { delivered } => PublishResponse {
            channel,
            route: "local",
            delivered: Some(delivered),
        },
    };
    Ok(SuccessResponse::new(response))
}

/// Subscribers of `channel` connected to this process
#[tracing::instrument(skip(state))]
pub async fn channel_subscribers(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<SuccessResponse<SubscribersResponse>, ErrorResponse> {
    let subscribers = state.connections.channel_subscribers(&channel).await;
    Ok(SuccessResponse::new(SubscribersResponse {
        count: subscribers.len(),
        channel,
        subscribers,
    }))
}

/// Send a typed notification straight to one identity on this process
#[tracing::instrument(skip(state, req))]
pub async fn notify_identity(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(req): Json<NotifyRequest>,
) -> Result<SuccessResponse<NotifyResponse>, ErrorResponse> {
    require_name("identity", &identity)?;
    require_name("type", &req.kind)?;

    let delivered = state.bus.notify_user(&identity, &req.kind, req.data).await;
    Ok(SuccessResponse::new(NotifyResponse {
        identity,
        delivered,
    }))
}
