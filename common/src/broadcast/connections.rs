// Per-process index of live connections and their channel subscriptions

use crate::errors::BroadcastError;
use crate::telemetry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};

/// Outbound side of one live connection
///
/// `send` must not block. `BroadcastError::SendQueueFull` drops the message
/// for this connection only; any other error marks the connection for pruning.
pub trait ConnectionSink: Send + Sync {
    fn send(&self, message: &str) -> Result<(), BroadcastError>;

    /// Called once when a newer connection for the same identity replaces this one
    fn close(&self) {}
}

impl ConnectionSink for mpsc::Sender<String> {
    fn send(&self, message: &str) -> Result<(), BroadcastError> {
        self.try_send(message.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BroadcastError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => BroadcastError::ConnectionClosed,
        })
    }
}

struct Connection {
    sink: Arc<dyn ConnectionSink>,
    generation: u64,
    channels: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    channels: HashMap<String, HashSet<String>>,
    next_generation: u64,
}

impl Inner {
    /// Drop a connection and every subscription it held; empty channels go too
    fn remove_connection(&mut self, identity: &str) -> Option<Arc<dyn ConnectionSink>> {
        let connection = self.connections.remove(identity)?;
        for channel in connection.channels {
            if let Some(subscribers) = self.channels.get_mut(&channel) {
                subscribers.remove(identity);
                if subscribers.is_empty() {
                    self.channels.remove(&channel);
                }
            }
        }
        Some(connection.sink)
    }

    /// The connection for `identity`, if it matches `generation` (any when `None`)
    fn connection_mut(&mut self, identity: &str, generation: Option<u64>) -> Option<&mut Connection> {
        self.connections
            .get_mut(identity)
            .filter(|connection| generation.is_none_or(|g| connection.generation == g))
    }

    fn add_subscription(&mut self, identity: &str, generation: Option<u64>, channel: &str) -> bool {
        let Some(connection) = self.connection_mut(identity, generation) else {
            return false;
        };
        connection.channels.insert(channel.to_string());
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(identity.to_string());
        true
    }

    /// `None` when the connection is missing or stale, else whether it was subscribed
    fn remove_subscription(
        &mut self,
        identity: &str,
        generation: Option<u64>,
        channel: &str,
    ) -> Option<bool> {
        let was_subscribed = self.connection_mut(identity, generation)?.channels.remove(channel);
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(identity);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
        Some(was_subscribed)
    }
}

type Target = (String, u64, Arc<dyn ConnectionSink>);

/// Bidirectional identity ↔ channel index
///
/// Both directions live under one lock. Delivery snapshots its targets, sends
/// without holding the lock, then prunes failed connections in a second pass.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to a sink, replacing any previous connection for it
    ///
    /// The replaced sink is told to close. Returns the generation that scopes
    /// `release`, `subscribe_connection` and `unsubscribe_connection`.
    #[instrument(skip(self, sink))]
    pub async fn register(&self, identity: &str, sink: Arc<dyn ConnectionSink>) -> u64 {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.remove_connection(identity) {
            previous.close();
            info!("Identity reconnected, previous connection replaced");
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.connections.insert(
            identity.to_string(),
            Connection {
                sink,
                generation,
                channels: HashSet::new(),
            },
        );
        telemetry::update_connection_count(inner.connections.len());
        debug!(generation, connections = inner.connections.len(), "Connection registered");
        generation
    }

    /// Unbind `identity` whatever its generation
    #[instrument(skip(self))]
    pub async fn unregister(&self, identity: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.remove_connection(identity).is_some();
        telemetry::update_connection_count(inner.connections.len());
        if removed {
            debug!("Connection unregistered");
        }
        removed
    }

    /// Unbind `identity` only if it is still the connection from `generation`
    #[instrument(skip(self))]
    pub async fn release(&self, identity: &str, generation: u64) -> bool {
        let mut inner = self.inner.write().await;
        let current = inner
            .connections
            .get(identity)
            .map(|connection| connection.generation);
        if current != Some(generation) {
            debug!("Connection already replaced, nothing to release");
            return false;
        }
        inner.remove_connection(identity);
        telemetry::update_connection_count(inner.connections.len());
        debug!("Connection released");
        true
    }

    /// Whether `generation` is still the live connection for `identity`
    pub async fn is_current(&self, identity: &str, generation: u64) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(identity)
            .is_some_and(|connection| connection.generation == generation)
    }

    /// Returns `false` when the identity is not connected
    pub async fn subscribe(&self, identity: &str, channel: &str) -> bool {
        let subscribed = self.inner.write().await.add_subscription(identity, None, channel);
        if subscribed {
            debug!(identity, channel, "Subscribed");
        }
        subscribed
    }

    /// Subscribe on behalf of one specific connection
    ///
    /// Returns `false` when that connection has been replaced or released.
    pub async fn subscribe_connection(&self, identity: &str, generation: u64, channel: &str) -> bool {
        let subscribed = self
            .inner
            .write()
            .await
            .add_subscription(identity, Some(generation), channel);
        if subscribed {
            debug!(identity, generation, channel, "Subscribed");
        } else {
            debug!(identity, generation, channel, "Stale connection, subscribe ignored");
        }
        subscribed
    }

    /// Returns whether the identity was subscribed
    pub async fn unsubscribe(&self, identity: &str, channel: &str) -> bool {
        let was_subscribed = self
            .inner
            .write()
            .await
            .remove_subscription(identity, None, channel)
            .unwrap_or(false);
        if was_subscribed {
            debug!(identity, channel, "Unsubscribed");
        }
        was_subscribed
    }

    /// Unsubscribe on behalf of one specific connection
    ///
    /// `None` when that connection has been replaced or released.
    pub async fn unsubscribe_connection(
        &self,
        identity: &str,
        generation: u64,
        channel: &str,
    ) -> Option<bool> {
        let outcome = self
            .inner
            .write()
            .await
            .remove_subscription(identity, Some(generation), channel);
        match outcome {
            Some(true) => debug!(identity, generation, channel, "Unsubscribed"),
            None => debug!(identity, generation, channel, "Stale connection, unsubscribe ignored"),
            Some(false) => {}
        }
        outcome
    }

    /// Send to every subscriber of `channel`; returns the delivered count
    pub async fn deliver_to_channel(&self, channel: &str, message: &str) -> usize {
        let targets: Vec<Target> = {
            let inner = self.inner.read().await;
            inner
                .channels
                .get(channel)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .filter_map(|identity| {
                            inner.connections.get(identity).map(|connection| {
                                (identity.clone(), connection.generation, connection.sink.clone())
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!(channel, "No local subscribers for channel");
            return 0;
        }
        self.fan_out(targets, message).await
    }

    /// Best-effort delivery to a single identity
    pub async fn send_direct(&self, identity: &str, message: &str) -> bool {
        let target: Option<Target> = {
            let inner = self.inner.read().await;
            inner.connections.get(identity).map(|connection| {
                (identity.to_string(), connection.generation, connection.sink.clone())
            })
        };

        match target {
            Some(target) => self.fan_out(vec![target], message).await == 1,
            None => {
                debug!(identity, "Identity not connected, direct message dropped");
                false
            }
        }
    }

    /// Send to every live connection regardless of subscriptions
    pub async fn broadcast_to_all(&self, message: &str) -> usize {
        let targets: Vec<Target> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .iter()
                .map(|(identity, connection)| {
                    (identity.clone(), connection.generation, connection.sink.clone())
                })
                .collect()
        };
        self.fan_out(targets, message).await
    }

    async fn fan_out(&self, targets: Vec<Target>, message: &str) -> usize {
        let mut delivered = 0;
        let mut failed: Vec<(String, u64)> = Vec::new();

        for (identity, generation, sink) in targets {
            match sink.send(message) {
                Ok(()) => delivered += 1,
                Err(BroadcastError::SendQueueFull) => {
                    warn!(identity = %identity, "Outbound queue full, message dropped for connection");
                }
                Err(e) => {
                    debug!(identity = %identity, error = %e, "Send failed, connection marked for pruning");
                    failed.push((identity, generation));
                }
            }
        }

        if !failed.is_empty() {
            let mut inner = self.inner.write().await;
            let mut pruned = 0;
            for (identity, generation) in &failed {
                let current = inner
                    .connections
                    .get(identity)
                    .map(|connection| connection.generation);
                if current == Some(*generation) && inner.remove_connection(identity).is_some() {
                    pruned += 1;
                }
            }
            telemetry::update_connection_count(inner.connections.len());
            telemetry::record_connections_pruned(pruned);
            info!(pruned, "Pruned dead connections after delivery");
        }

        telemetry::record_broadcast_delivered(delivered);
        delivered
    }

    pub async fn connected_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> =
            self.inner.read().await.connections.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn channel_subscribers(&self, channel: &str) -> Vec<String> {
        let mut subscribers: Vec<String> = self
            .inner
            .read()
            .await
            .channels
            .get(channel)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    pub async fn subscriptions_of(&self, identity: &str) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .read()
            .await
            .connections
            .get(identity)
            .map(|connection| connection.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.channels.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}
