// Notification bus: local connection index plus cross-process relay

pub mod bus;
pub mod connections;
pub mod transport;

pub use bus::{payload_text, BroadcastBus, PublishOutcome, SubscriberHealth};
pub use connections::{ConnectionRegistry, ConnectionSink};
pub use transport::{InMemoryTransport, MessageStream, PubSubTransport, RedisTransport};
