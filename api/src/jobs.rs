// Built-in job functions registered at startup

use chrono::Utc;
use common::broadcast::BroadcastBus;
use common::models::Notification;
use common::registry::{JobContext, JobRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const DEFAULT_CHANNEL: &str = "home";

/// Registry holding every job function this binary ships
pub fn build_registry(bus: Arc<BroadcastBus>) -> JobRegistry {
    let heartbeat_bus = bus.clone();
    let status_bus = bus.clone();
    let notify_bus = bus;

    JobRegistry::builder()
        .register_fn("heartbeat", move |ctx| heartbeat(heartbeat_bus.clone(), ctx))
        .register_fn("push_all_task_status", move |ctx| {
            push_all_task_status(status_bus.clone(), ctx)
        })
        .register_fn("send_system_notifications", move |ctx| {
            send_system_notifications(notify_bus.clone(), ctx)
        })
        .build()
}

fn target_channel(ctx: &JobContext) -> String {
    ctx.kwarg_str("channel")
        .filter(|channel| !channel.is_empty())
        .unwrap_or(DEFAULT_CHANNEL)
        .to_string()
}

/// Publish a liveness frame
async fn heartbeat(bus: Arc<BroadcastBus>, ctx: JobContext) -> anyhow::Result<()> {
    let channel = target_channel(&ctx);
    let notification = Notification::new(
        "heartbeat",
        json!({
            "job_id": ctx.job_id,
            "scheduled_at": ctx.scheduled_at,
            "sent_at": Utc::now(),
        }),
    );
    bus.publish_notification(&channel, &notification).await;
    Ok(())
}

/// Publish the live scheduler status as a `task_status` frame
async fn push_all_task_status(bus: Arc<BroadcastBus>, ctx: JobContext) -> anyhow::Result<()> {
    let channel = target_channel(&ctx);
    let status = ctx.scheduler.status().await;
    let count = status.jobs.len();
    let notification = Notification::new(
        "task_status",
        json!({
            "jobs": status.jobs,
            "updated_at": Utc::now(),
        }),
    );
    bus.publish_notification(&channel, &notification).await;
    info!(channel = %channel, jobs = count, "Pushed task status");
    Ok(())
}

fn default_notifications() -> Vec<Value> {
    vec![
        json!({
            "id": "system_maintenance",
            "title": "System maintenance",
            "message": "All services are running normally",
            "notification_type": "info",
        }),
        json!({
            "id": "performance_monitor",
            "title": "Performance monitor",
            "message": "Response times are within normal range",
            "notification_type": "info",
        }),
    ]
}

/// Publish one `system_notification` frame per entry in `kwargs.notifications`
async fn send_system_notifications(
    bus: Arc<BroadcastBus>,
    ctx: JobContext,
) -> anyhow::Result<()> {
    let channel = target_channel(&ctx);
    let notifications = match ctx.kwarg("notifications") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => anyhow::bail!("'notifications' must be a list, got {}", other),
        None => default_notifications(),
    };

    for data in &notifications {
        let notification = Notification::new("system_notification", data.clone());
        bus.publish_notification(&channel, &notification).await;
    }
    info!(channel = %channel, count = notifications.len(), "System notifications sent");
    Ok(())
}
