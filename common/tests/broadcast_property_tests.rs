// Property-based tests for the notification bus
// Feature: chronocast-broadcast

use common::broadcast::{BroadcastBus, ConnectionRegistry, InMemoryTransport, PublishOutcome};
use common::config::Settings;
use common::models::Notification;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Helper: a registered identity with its receiving end
async fn connect(
    registry: &ConnectionRegistry,
    identity: &str,
) -> (u64, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    let generation = registry.register(identity, Arc::new(tx)).await;
    (generation, rx)
}

async fn wait_connected(bus: &BroadcastBus) {
    for _ in 0..200 {
        if bus.health().connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscriber never connected");
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// Property 10: Unregister cascade
// Feature: chronocast-broadcast, Property 10: Unregister removes identity from every channel
// For any subscription pattern, Unregister(identity) removes it from every
// channel and no channel is left without subscribers.
#[test]
fn property_10_unregister_cascades_and_leaves_no_empty_channels() {
    proptest!(ProptestConfig::with_cases(64), |(
        subscriptions in prop::collection::vec(
            ("u[0-4]", "ch[0-5]"),
            1..30,
        ),
        victim in "u[0-4]",
    )| {
        let rt = runtime();
        let (remaining, channels, channel_count, victim_subs) = rt.block_on(async {
            let registry = ConnectionRegistry::new();
            let mut receivers = Vec::new();
            for identity in ["u0", "u1", "u2", "u3", "u4"] {
                receivers.push(connect(&registry, identity).await);
            }
            for (identity, channel) in &subscriptions {
                registry.subscribe(identity, channel).await;
            }

            registry.unregister(&victim).await;

            let mut channels = BTreeMap::new();
            for channel in ["ch0", "ch1", "ch2", "ch3", "ch4", "ch5"] {
                channels.insert(channel.to_string(), registry.channel_subscribers(channel).await);
            }
            (
                registry.connected_identities().await,
                channels,
                registry.channel_count().await,
                registry.subscriptions_of(&victim).await,
            )
        });

        prop_assert!(!remaining.contains(&victim));
        prop_assert!(victim_subs.is_empty());

        let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (identity, channel) in &subscriptions {
            if identity != &victim {
                expected.entry(channel.clone()).or_default().insert(identity.clone());
            }
        }
        for (channel, subscribers) in &channels {
            prop_assert!(!subscribers.contains(&victim));
            let want: Vec<String> = expected
                .get(channel)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            prop_assert_eq!(subscribers, &want, "channel {}", channel);
        }
        prop_assert_eq!(channel_count, expected.len());
    });
}

// Property 11: Unsubscribe stops delivery
// Feature: chronocast-broadcast, Property 11: Unsubscribed channels are not delivered
#[test]
fn property_11_unsubscribe_stops_delivery() {
    proptest!(ProptestConfig::with_cases(64), |(
        channel in "[a-z]{1,10}",
        message in "[ -~]{1,40}",
    )| {
        let rt = runtime();
        let (before, after, queued) = rt.block_on(async {
            let registry = ConnectionRegistry::new();
            let (_, mut rx) = connect(&registry, "u1").await;
            registry.subscribe("u1", &channel).await;

            let before = registry.deliver_to_channel(&channel, &message).await;
            registry.unsubscribe("u1", &channel).await;
            let after = registry.deliver_to_channel(&channel, &message).await;

            let mut queued = Vec::new();
            while let Ok(text) = rx.try_recv() {
                queued.push(text);
            }
            (before, after, queued)
        });

        prop_assert_eq!(before, 1);
        prop_assert_eq!(after, 0);
        prop_assert_eq!(queued, vec![message.clone()]);
    });
}

// Concrete scenario: Register, Subscribe, DeliverToChannel
#[tokio::test]
async fn test_deliver_to_channel_scenario() {
    let registry = ConnectionRegistry::new();
    let (_, mut rx) = connect(&registry, "u1").await;
    registry.subscribe("u1", "home").await;

    assert_eq!(registry.deliver_to_channel("home", "hi").await, 1);
    assert_eq!(rx.recv().await.unwrap(), "hi");
}

// Property 12: Cross-process fan-out
// Feature: chronocast-broadcast, Property 12: Exactly one copy per remote subscriber
// Process A publishes on "home"; process B, holding a subscribed connection,
// receives exactly one copy.
#[tokio::test]
async fn test_cross_process_fan_out_delivers_exactly_once() {
    let config = Settings::default().broadcast;
    let transport = Arc::new(InMemoryTransport::new());

    let registry_a = Arc::new(ConnectionRegistry::new());
    let registry_b = Arc::new(ConnectionRegistry::new());
    let bus_a = BroadcastBus::new(&config, Some(transport.clone()), registry_a.clone());
    let bus_b = BroadcastBus::new(&config, Some(transport.clone()), registry_b.clone());
    bus_a.start().await;
    bus_b.start().await;
    wait_connected(&bus_a).await;
    wait_connected(&bus_b).await;

    let (_, mut rx_b) = connect(&registry_b, "remote").await;
    registry_b.subscribe("remote", "home").await;
    let (_, mut rx_other) = connect(&registry_b, "elsewhere").await;
    registry_b.subscribe("elsewhere", "news").await;

    let notification = Notification::new("article_published", json!({ "id": 7 }));
    let outcome = bus_a.publish_notification("home", &notification).await;
    assert_eq!(outcome, PublishOutcome::Relayed);

    let received = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&received).unwrap();
    assert_eq!(value, json!({ "type": "article_published", "data": { "id": 7 } }));

    assert!(tokio::time::timeout(Duration::from_millis(100), rx_b.recv())
        .await
        .is_err());
    assert!(rx_other.try_recv().is_err());

    bus_a.stop().await;
    bus_b.stop().await;
}

// Property 13: Local fallback while the transport is down
// Feature: chronocast-broadcast, Property 13: Publishing during an outage reaches local subscribers
#[tokio::test]
async fn test_outage_falls_back_to_local_delivery() {
    let config = Settings::default().broadcast;
    let transport = Arc::new(InMemoryTransport::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let bus = BroadcastBus::new(&config, Some(transport.clone()), registry.clone());

    let (_, mut rx) = connect(&registry, "u1").await;
    registry.subscribe("u1", "home").await;

    transport.set_available(false);
    let outcome = bus.publish("home", json!({ "type": "heartbeat" })).await;
    assert_eq!(outcome, PublishOutcome::LocalFallback { delivered: 1 });
    assert_eq!(rx.recv().await.unwrap(), r#"{"type":"heartbeat"}"#);
}

// Closed connections are pruned after the delivery pass, not during it
#[tokio::test]
async fn test_closed_connection_is_pruned_after_delivery() {
    let registry = ConnectionRegistry::new();
    let (_, rx_dead) = connect(&registry, "dead").await;
    let (_, mut rx_live) = connect(&registry, "live").await;
    registry.subscribe("dead", "home").await;
    registry.subscribe("live", "home").await;
    drop(rx_dead);

    assert_eq!(registry.deliver_to_channel("home", "m1").await, 1);
    assert_eq!(rx_live.recv().await.unwrap(), "m1");
    assert_eq!(registry.connected_identities().await, vec!["live".to_string()]);
    assert_eq!(registry.channel_subscribers("home").await, vec!["live".to_string()]);
}

// A replaced connection cannot release its successor
#[tokio::test]
async fn test_stale_generation_release_is_ignored() {
    let registry = ConnectionRegistry::new();
    let (old_generation, _old_rx) = connect(&registry, "u1").await;
    let (new_generation, mut new_rx) = connect(&registry, "u1").await;
    assert_ne!(old_generation, new_generation);

    assert!(!registry.release("u1", old_generation).await);
    assert!(registry.send_direct("u1", "still here").await);
    assert_eq!(new_rx.recv().await.unwrap(), "still here");

    assert!(registry.release("u1", new_generation).await);
    assert_eq!(registry.connection_count().await, 0);
}
