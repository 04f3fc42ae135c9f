//! Redpanda transport for the order fulfillment workers.
//!
//! This crate implements the [`Transport`] and [`Delivery`] contracts from
//! `order-fulfillment-core` on top of rdkafka, so the workers run against
//! Redpanda or any other Kafka-compatible broker.
//!
//! # Mapping
//!
//! ```text
//! channel "submit-order"            ──▶ topic "submit-order"
//! channel "submit-order/$DeadLetterQueue" ──▶ topic "submit-order.DeadLetterQueue"
//! TransportMessage fields           ──▶ record headers (see [`envelope`])
//! correlation id                    ──▶ record key (keeps related messages in order)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - [`Delivery::complete`] commits the record's offset
//! - [`Delivery::abandon`] produces the record again (or to the dead-letter
//!   topic once it has been delivered `max_deliveries` times) and then commits
//! - A record whose `defer-until` header lies in the future is held back on
//!   its own timer until that instant. Records behind it keep flowing, so
//!   deliveries from one partition may arrive out of offset order.
//!
//! Commits are per offset; a record committed ahead of an unfinished one on
//! the same partition moves the group offset past both. A crash in that window
//! loses the unfinished record.
//!
//! # Example
//!
//! ```no_run
//! use order_fulfillment_redpanda::RedpandaTransport;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("fulfillment-workers")
//!     .build()?;
//!
//! let mut deliveries = transport.subscribe("process-order")?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     // hand the delivery to a handler
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;

use chrono::Utc;
use envelope::{EnvelopeHeaders, to_headers, topic_name};
use futures::{Stream, StreamExt};
use order_fulfillment_core::channels;
use order_fulfillment_core::transport::{Delivery, Transport, TransportError, TransportMessage};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Message as KafkaMessage, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default deliveries before a record is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// Errors building a [`RedpandaTransport`].
#[derive(Error, Debug)]
pub enum RedpandaError {
    /// Required configuration is missing.
    #[error("Transport misconfigured: {0}")]
    Config(String),

    /// The Kafka client rejected the configuration.
    #[error("Failed to create Kafka client: {0}")]
    Client(#[from] KafkaError),
}

/// Producer-side state shared by the transport and its deliveries.
struct Producer {
    producer: FutureProducer,
    timeout: Duration,
    max_deliveries: u32,
}

impl Producer {
    async fn produce(
        &self,
        channel: &str,
        message: &TransportMessage,
        previous_deliveries: u32,
    ) -> Result<(), TransportError> {
        let topic = topic_name(channel);
        let record = FutureRecord::to(&topic)
            .payload(&message.body)
            .key(&message.correlation_id)
            .headers(to_headers(message, previous_deliveries));

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    channel,
                    topic = %topic,
                    partition,
                    offset,
                    message_id = %message.message_id,
                    "Record produced"
                );
                Ok(())
            }
            Err((error, _)) => {
                tracing::error!(channel, topic = %topic, error = %error, "Failed to produce record");
                Err(TransportError::SendFailed {
                    channel: channel.to_string(),
                    reason: error.to_string(),
                })
            }
        }
    }
}

/// Kafka-compatible transport.
///
/// # Example
///
/// ```no_run
/// use order_fulfillment_redpanda::RedpandaTransport;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RedpandaTransport::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .max_deliveries(5)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaTransport {
    producer: Arc<Producer>,
    brokers: String,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaTransport {
    /// Create a transport for `brokers` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, RedpandaError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by subscriptions.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Deliveries from `channel`.
    ///
    /// A background task owns the consumer and forwards records through a
    /// bounded buffer. The stream ends if that task stops.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    pub fn subscribe(
        &self,
        channel: &str,
    ) -> Result<impl Stream<Item = Result<KafkaDelivery, TransportError>> + Send + use<>, TransportError>
    {
        let topic = topic_name(channel);
        let subscription_failed = |reason: String| TransportError::SubscriptionFailed {
            channel: channel.to_string(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

        tracing::info!(
            channel,
            topic = %topic,
            consumer_group = %self.consumer_group,
            buffer_size = self.buffer_size,
            "Subscribed to channel"
        );

        let consumer = Arc::new(consumer);
        let producer = Arc::clone(&self.producer);
        let channel = channel.to_string();
        let (tx, mut rx) = mpsc::channel(self.buffer_size);

        tokio::spawn(async move {
            let mut records = consumer.stream();

            while let Some(received) = records.next().await {
                let forwarded = match received {
                    Ok(record) => {
                        let record = record.detach();
                        let headers = record
                            .headers()
                            .map(EnvelopeHeaders::read)
                            .unwrap_or_default();
                        let wait = headers.remaining_deferral(Utc::now());

                        let delivery = KafkaDelivery {
                            consumer: Arc::clone(&consumer),
                            producer: Arc::clone(&producer),
                            channel: channel.clone(),
                            record,
                            headers,
                            settled: AtomicBool::new(false),
                        };

                        if let Some(wait) = wait {
                            tracing::trace!(channel = %channel, ?wait, "Holding back deferred record");
                            forward_when_due(&tx, Ok(delivery), wait);
                            continue;
                        }
                        Ok(delivery)
                    }
                    Err(error) => Err(TransportError::SubscriptionFailed {
                        channel: channel.clone(),
                        reason: format!("Failed to receive record: {error}"),
                    }),
                };

                if tx.send(forwarded).await.is_err() {
                    tracing::debug!(channel = %channel, "Delivery receiver dropped, exiting consumer task");
                    break;
                }
            }

            tracing::debug!(channel = %channel, "Consumer task exiting");
        });

        Ok(async_stream::stream! {
            while let Some(delivery) = rx.recv().await {
                yield delivery;
            }
        })
    }
}

/// Hand `item` to `tx` once `wait` has passed, without holding up the records
/// behind it.
fn forward_when_due<T: Send + 'static>(tx: &mpsc::Sender<T>, item: T, wait: Duration) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        // A closed receiver means the subscription was dropped.
        let _ = tx.send(item).await;
    });
}

impl Transport for RedpandaTransport {
    fn send(
        &self,
        channel: &str,
        message: TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let channel = channel.to_string();
        Box::pin(async move { self.producer.produce(&channel, &message, 0).await })
    }
}

/// Builder for configuring a [`RedpandaTransport`].
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    max_deliveries: Option<u32>,
}

impl RedpandaTransportBuilder {
    /// Set the comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group shared by every worker instance.
    ///
    /// Default: `"order-fulfillment"`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set how many deliveries may wait between the consumer and the handler.
    ///
    /// Default: 1000. Zero is raised to one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so commands sent before the first worker started
    /// are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set how many deliveries a record gets before it is dead-lettered.
    ///
    /// Default: [`DEFAULT_MAX_DELIVERIES`]. Zero is raised to one.
    #[must_use]
    pub fn max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = Some(max_deliveries.max(1));
        self
    }

    /// Build the [`RedpandaTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::Config`] if no brokers were set and
    /// [`RedpandaError::Client`] if the producer cannot be created.
    pub fn build(self) -> Result<RedpandaTransport, RedpandaError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| RedpandaError::Config("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .create()?;

        let transport = RedpandaTransport {
            producer: Arc::new(Producer {
                producer,
                timeout,
                max_deliveries: self.max_deliveries.unwrap_or(DEFAULT_MAX_DELIVERIES),
            }),
            brokers,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "order-fulfillment".to_string()),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %transport.brokers,
            acks = %acks,
            consumer_group = %transport.consumer_group,
            max_deliveries = transport.producer.max_deliveries,
            "RedpandaTransport created"
        );
        Ok(transport)
    }
}

/// A record received through [`RedpandaTransport::subscribe`].
pub struct KafkaDelivery {
    consumer: Arc<StreamConsumer>,
    producer: Arc<Producer>,
    channel: String,
    record: OwnedMessage,
    headers: EnvelopeHeaders,
    settled: AtomicBool,
}

impl KafkaDelivery {
    /// Topic, partition and offset of the record.
    #[must_use]
    pub fn position(&self) -> (&str, i32, i64) {
        (self.record.topic(), self.record.partition(), self.record.offset())
    }

    fn settle(&self) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(self.settle_failed("delivery already settled".to_string()));
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), TransportError> {
        let (topic, partition, offset) = self.position();
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| self.settle_failed(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| self.settle_failed(e.to_string()))
    }

    fn settle_failed(&self, reason: String) -> TransportError {
        TransportError::SettleFailed {
            message_id: self.headers.message_id.clone().unwrap_or_default(),
            reason,
        }
    }
}

impl Delivery for KafkaDelivery {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn body(&self) -> Option<&[u8]> {
        self.record.payload()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id.as_deref()
    }

    fn message_id(&self) -> Option<&str> {
        self.headers.message_id.as_deref()
    }

    fn delivery_count(&self) -> u32 {
        self.headers.previous_deliveries.saturating_add(1)
    }

    fn complete(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.settle()?;
            self.commit()
        })
    }

    fn abandon(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.settle()?;

            let message = self
                .headers
                .to_message(self.record.payload().unwrap_or_default().to_vec());
            let deliveries = self.delivery_count();

            if deliveries >= self.producer.max_deliveries {
                let dead_letter = channels::dead_letter(&self.channel);
                tracing::warn!(
                    channel = %self.channel,
                    deliveries,
                    dead_letter = %dead_letter,
                    "Delivery limit reached; dead-lettering record"
                );
                self.producer.produce(&dead_letter, &message, 0).await?;
            } else {
                self.producer
                    .produce(&self.channel, &message, deliveries)
                    .await?;
            }

            self.commit()
        })
    }
}
