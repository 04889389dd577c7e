// Publish/subscribe transports carrying the shared broadcast topic

use crate::config::RedisConfig;
use crate::errors::BroadcastError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument};

/// Inbound messages of one subscription; the stream ends when it is lost
pub type MessageStream = BoxStream<'static, Result<String, BroadcastError>>;

/// Any transport offering publish/subscribe reachable from every process
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), BroadcastError>;

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BroadcastError>;
}

/// Redis `PUBLISH` / `SUBSCRIBE` transport
pub struct RedisTransport {
    client: Client,
    publisher: Mutex<Option<ConnectionManager>>,
    publish_timeout: Duration,
}

impl RedisTransport {
    /// Create the transport; no connection is opened until first use
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub fn new(config: &RedisConfig) -> Result<Self, BroadcastError> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            BroadcastError::TransportUnavailable(format!("Failed to create Redis client: {}", e))
        })?;

        info!("Redis transport configured");
        Ok(Self {
            client,
            publisher: Mutex::new(None),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }

    /// Shared publishing connection, opened lazily
    async fn connection(&self) -> Result<ConnectionManager, BroadcastError> {
        let mut guard = self.publisher.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }
        let connection = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(connection.clone());
        debug!("Redis publishing connection established");
        Ok(connection)
    }

    /// Verify Redis answers `PING`
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), BroadcastError> {
        let ping = async {
            let mut connection = self.connection().await?;
            let response: String = redis::cmd("PING").query_async(&mut connection).await?;
            if response != "PONG" {
                return Err(BroadcastError::TransportUnavailable(format!(
                    "Unexpected PING response: {}",
                    response
                )));
            }
            Ok(())
        };
        tokio::time::timeout(self.publish_timeout, ping)
            .await
            .map_err(|_| BroadcastError::PublishTimeout(self.publish_timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), BroadcastError> {
        let publish = async {
            let mut connection = self.connection().await?;
            let receivers: i64 = connection.publish(topic, message).await?;
            debug!(topic, receivers, "Published to Redis");
            Ok::<(), BroadcastError>(())
        };
        tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| BroadcastError::PublishTimeout(self.publish_timeout.as_millis() as u64))?
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BroadcastError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BroadcastError::SubscribeFailed(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BroadcastError::SubscribeFailed(e.to_string()))?;

        info!(topic, "Subscribed to Redis topic");
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(BroadcastError::from));
        Ok(stream.boxed())
    }
}

type Subscriber = (String, mpsc::UnboundedSender<Result<String, BroadcastError>>);

/// In-process transport shared by several buses in one process
///
/// Stands in for Redis in tests and single-node runs. It can simulate an
/// outage and drop every live subscription.
#[derive(Default)]
pub struct InMemoryTransport {
    subscribers: Mutex<Vec<Subscriber>>,
    unavailable: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, publish and subscribe fail
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// End every live subscription stream
    pub async fn sever_subscriptions(&self) {
        self.subscribers.lock().await.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    fn check_available(&self) -> Result<(), BroadcastError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BroadcastError::TransportUnavailable(
                "in-memory transport is down".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), BroadcastError> {
        self.check_available()?;
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|(subscribed, tx)| {
            subscribed != topic || tx.send(Ok(message.to_string())).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BroadcastError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push((topic.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
