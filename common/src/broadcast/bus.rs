// Cross-process notification bus
//
// Every message travels on one fixed topic as `{"channel", "payload"}`. Each
// process runs one subscriber loop that hands inbound envelopes to its local
// `ConnectionRegistry`. When the transport is missing or down, publishing
// falls back to local delivery.

use crate::broadcast::connections::ConnectionRegistry;
use crate::broadcast::transport::PubSubTransport;
use crate::config::BroadcastConfig;
use crate::models::{BroadcastEnvelope, Notification};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// How a published message was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport; every process delivers it from its subscriber
    Relayed,
    /// Transport missing or failing; delivered to this process only
    LocalFallback { delivered: usize },
}

/// Liveness of the subscriber loop, exposed on `/health`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberHealth {
    pub enabled: bool,
    pub connected: bool,
    pub reconnects: u64,
    pub messages_received: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl SubscriberHealth {
    pub fn is_healthy(&self) -> bool {
        !self.enabled || self.connected
    }
}

#[derive(Default)]
struct HealthState {
    connected: AtomicBool,
    reconnects: AtomicU64,
    messages_received: AtomicU64,
    /// Milliseconds since the epoch; 0 when nothing was received
    last_message_ms: AtomicI64,
}

impl HealthState {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        telemetry::update_subscriber_up(connected);
    }

    fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Text sent to clients: strings go out verbatim, anything else as JSON
pub fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct BroadcastBus {
    topic: String,
    transport: Option<Arc<dyn PubSubTransport>>,
    connections: Arc<ConnectionRegistry>,
    retry: Arc<dyn RetryStrategy>,
    health: Arc<HealthState>,
    lifecycle: Mutex<Lifecycle>,
}

impl BroadcastBus {
    pub fn new(
        config: &BroadcastConfig,
        transport: Option<Arc<dyn PubSubTransport>>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            topic: config.topic.clone(),
            transport,
            connections,
            retry: Arc::new(ExponentialBackoff::with_config(
                config.reconnect_base_delay_ms,
                config.reconnect_max_delay_ms,
                0.1,
            )),
            health: Arc::new(HealthState::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Bus without a transport: every publish is delivered locally
    pub fn local_only(config: &BroadcastConfig, connections: Arc<ConnectionRegistry>) -> Self {
        Self::new(config, None, connections)
    }

    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Fire-and-forget publish of `payload` on `channel`
    ///
    /// Never fails: transport errors degrade to local delivery.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, channel: &str, payload: Value) -> PublishOutcome {
        let envelope = BroadcastEnvelope {
            channel: channel.to_string(),
            payload,
        };

        if let Some(transport) = &self.transport {
            match serde_json::to_string(&envelope) {
                Ok(text) => match transport.publish(&self.topic, &text).await {
                    Ok(()) => {
                        telemetry::record_broadcast_published("relay");
                        debug!("Message relayed through transport");
                        return PublishOutcome::Relayed;
                    }
                    Err(e) => {
                        warn!(error = %e, "Transport publish failed, delivering locally");
                    }
                },
                Err(e) => {
                    error!(error = %e, "Failed to serialize envelope, delivering locally");
                }
            }
        }

        let delivered = self
            .connections
            .deliver_to_channel(channel, &payload_text(&envelope.payload))
            .await;
        telemetry::record_broadcast_published("local");
        debug!(delivered, "Message delivered locally");
        PublishOutcome::LocalFallback { delivered }
    }

    /// Publish a typed `{type, data}` notification
    pub async fn publish_notification(
        &self,
        channel: &str,
        notification: &Notification,
    ) -> PublishOutcome {
        self.publish(channel, notification.to_value()).await
    }

    /// Direct delivery to one identity connected to this process
    #[instrument(skip(self, data))]
    pub async fn notify_user(&self, identity: &str, kind: &str, data: Value) -> bool {
        let notification = Notification::new(kind, data);
        self.connections
            .send_direct(identity, &notification.to_value().to_string())
            .await
    }

    /// Start the subscriber loop; no-op without a transport or when running
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn start(&self) {
        let Some(transport) = self.transport.clone() else {
            info!("No pub/sub transport configured, running in local-only mode");
            return;
        };

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.handle.is_some() {
            warn!("Subscriber loop already running, ignoring start");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(subscriber_loop(
            transport,
            self.topic.clone(),
            self.connections.clone(),
            self.retry.clone(),
            self.health.clone(),
            shutdown_rx,
        ));
        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.handle = Some(handle);
        info!("Subscriber loop started");
    }

    /// Stop the subscriber loop and wait for it to exit
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.handle.take() else {
            return;
        };
        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(e) = handle.await {
            error!(error = %e, "Subscriber loop terminated abnormally");
        }
        self.health.set_connected(false);
        info!("Subscriber loop stopped");
    }

    pub fn health(&self) -> SubscriberHealth {
        let last_ms = self.health.last_message_ms.load(Ordering::Relaxed);
        SubscriberHealth {
            enabled: self.transport.is_some(),
            connected: self.health.connected.load(Ordering::SeqCst),
            reconnects: self.health.reconnects.load(Ordering::Relaxed),
            messages_received: self.health.messages_received.load(Ordering::Relaxed),
            last_message_at: if last_ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_ms).single()
            },
        }
    }
}

/// Forward one inbound envelope to local subscribers
async fn handle_inbound(connections: &ConnectionRegistry, health: &HealthState, text: &str) {
    let envelope: BroadcastEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed broadcast message, skipping");
            return;
        }
    };
    health.record_message();

    let delivered = connections
        .deliver_to_channel(&envelope.channel, &payload_text(&envelope.payload))
        .await;
    debug!(channel = %envelope.channel, delivered, "Inbound broadcast delivered");
}

/// Hold a subscription to `topic`, reconnecting with backoff until shutdown
async fn subscriber_loop(
    transport: Arc<dyn PubSubTransport>,
    topic: String,
    connections: Arc<ConnectionRegistry>,
    retry: Arc<dyn RetryStrategy>,
    health: Arc<HealthState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        match transport.subscribe(&topic).await {
            Ok(mut stream) => {
                attempt = 0;
                health.set_connected(true);
                info!(topic = %topic, "Subscriber connected");

                loop {
                    tokio::select! {
                        item = stream.next() => match item {
                            Some(Ok(text)) => handle_inbound(&connections, &health, &text).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "Subscription error, reconnecting");
                                break;
                            }
                            None => {
                                warn!("Subscription closed, reconnecting");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown signal received, stopping subscriber loop");
                            health.set_connected(false);
                            return;
                        }
                    }
                }
                health.set_connected(false);
            }
            Err(e) => {
                warn!(error = %e, attempt, "Failed to subscribe");
            }
        }

        let delay = retry.next_delay(attempt);
        attempt = attempt.saturating_add(1);
        health.reconnects.fetch_add(1, Ordering::Relaxed);
        telemetry::record_subscriber_reconnect();
        debug!(delay_ms = delay.as_millis() as u64, attempt, "Waiting before reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping subscriber loop");
                return;
            }
        }
    }
}
