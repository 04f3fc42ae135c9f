//! Integration tests for [`RedpandaTransport`] against a running broker.
//!
//! These tests validate:
//! - Send/subscribe round-trip with envelope headers intact
//! - Deferred records are held back until their instant
//! - Abandoned records are redelivered with a higher delivery count
//! - Records are dead-lettered once the delivery limit is reached
//!
//! # Running These Tests
//!
//! The tests are `#[ignore]` by default because they need a Redpanda or Kafka
//! broker. Point `FULFILLMENT_BROKERS` at one and run them explicitly:
//!
//! ```bash
//! FULFILLMENT_BROKERS=localhost:9092 \
//!     cargo test -p order-fulfillment-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use chrono::{TimeDelta, Utc};
use futures::{Stream, StreamExt};
use order_fulfillment_core::channels;
use order_fulfillment_core::transport::{Delivery, Transport, TransportError, TransportMessage};
use order_fulfillment_redpanda::{KafkaDelivery, RedpandaTransport};
use std::time::{Duration, Instant};

fn brokers() -> String {
    std::env::var("FULFILLMENT_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())
}

/// A channel name no other run has used, so stale records never interfere.
fn fresh_channel(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

fn transport(max_deliveries: u32) -> RedpandaTransport {
    RedpandaTransport::builder()
        .brokers(brokers())
        .consumer_group(format!("it-{}", uuid::Uuid::new_v4().simple()))
        .max_deliveries(max_deliveries)
        .build()
        .expect("transport should build")
}

fn message(body: &serde_json::Value) -> TransportMessage {
    TransportMessage {
        body: serde_json::to_vec(body).expect("body should serialize"),
        content_type: "application/json".to_string(),
        correlation_id: "corr-it".to_string(),
        message_id: uuid::Uuid::new_v4().to_string(),
        scheduled_enqueue_time_utc: None,
    }
}

async fn next_delivery<S>(stream: &mut S) -> KafkaDelivery
where
    S: Stream<Item = Result<KafkaDelivery, TransportError>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("a delivery should arrive within 30s")
        .expect("stream should stay open")
        .expect("delivery should be readable")
}

#[tokio::test]
#[ignore = "requires a Redpanda/Kafka broker at FULFILLMENT_BROKERS"]
async fn round_trip_preserves_the_envelope() {
    let channel = fresh_channel("round-trip");
    let transport = transport(3);
    let sent = message(&serde_json::json!({ "order": { "orderId": "ABC123" } }));

    let mut deliveries = Box::pin(transport.subscribe(&channel).expect("subscribe"));
    transport
        .send(&channel, sent.clone())
        .await
        .expect("send should succeed");

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.channel(), channel);
    assert_eq!(delivery.body(), Some(sent.body.as_slice()));
    assert_eq!(delivery.correlation_id(), Some("corr-it"));
    assert_eq!(delivery.message_id(), Some(sent.message_id.as_str()));
    assert_eq!(delivery.delivery_count(), 1);

    delivery.complete().await.expect("complete should commit");
    assert!(delivery.complete().await.is_err(), "settling twice is rejected");
}

#[tokio::test]
#[ignore = "requires a Redpanda/Kafka broker at FULFILLMENT_BROKERS"]
async fn deferred_records_are_held_back() {
    let channel = fresh_channel("deferred");
    let transport = transport(3);
    let mut deferred = message(&serde_json::json!({}));
    deferred.scheduled_enqueue_time_utc = Some(Utc::now() + TimeDelta::seconds(3));

    let mut deliveries = Box::pin(transport.subscribe(&channel).expect("subscribe"));
    let started = Instant::now();
    transport.send(&channel, deferred).await.expect("send");

    let delivery = next_delivery(&mut deliveries).await;
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "deferred record arrived after {:?}",
        started.elapsed()
    );
    delivery.complete().await.expect("complete");
}

#[tokio::test]
#[ignore = "requires a Redpanda/Kafka broker at FULFILLMENT_BROKERS"]
async fn abandoned_records_come_back_then_dead_letter() {
    let channel = fresh_channel("abandon");
    let dead_letter = channels::dead_letter(&channel);
    let transport = transport(2);
    let sent = message(&serde_json::json!({ "attempt": "first" }));

    let mut deliveries = Box::pin(transport.subscribe(&channel).expect("subscribe"));
    let mut dead_letters = Box::pin(transport.subscribe(&dead_letter).expect("subscribe dlq"));
    transport.send(&channel, sent.clone()).await.expect("send");

    let first = next_delivery(&mut deliveries).await;
    assert_eq!(first.delivery_count(), 1);
    first.abandon().await.expect("abandon should republish");

    let second = next_delivery(&mut deliveries).await;
    assert_eq!(second.delivery_count(), 2);
    assert_eq!(second.message_id(), Some(sent.message_id.as_str()));
    second.abandon().await.expect("abandon should dead-letter");

    let dead = next_delivery(&mut dead_letters).await;
    assert_eq!(dead.channel(), dead_letter);
    assert_eq!(dead.body(), Some(sent.body.as_slice()));
    assert_eq!(dead.delivery_count(), 1);
    dead.complete().await.expect("complete");
}
