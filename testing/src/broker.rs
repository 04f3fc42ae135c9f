//! In-memory broker and delivery doubles.
//!
//! [`InMemoryBroker`] behaves like a queue broker with the features the
//! pipeline relies on:
//!
//! - Messages published with a visibility instant are not delivered before it
//! - Delivered messages are in flight until completed or abandoned
//! - Abandoned messages are redelivered with an incremented delivery count
//! - After `max_deliveries` abandonments a message moves to the channel's
//!   dead-letter channel
//!
//! Every send and settlement is appended to a journal so tests can assert on
//! the order in which a handler did things.

#![allow(clippy::missing_panics_doc)]

use async_stream::stream;
use futures::Stream;
use order_fulfillment_core::channels;
use order_fulfillment_core::codec;
use order_fulfillment_core::environment::{Clock, SystemClock};
use order_fulfillment_core::message::Message;
use order_fulfillment_core::publisher::envelope;
use order_fulfillment_core::transport::{Delivery, Transport, TransportError, TransportMessage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// Something the broker did, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerOperation {
    /// A message was accepted onto a channel.
    Sent {
        /// Channel name.
        channel: String,
        /// Transport message id.
        message_id: String,
    },
    /// A delivery was completed.
    Completed {
        /// Channel name.
        channel: String,
        /// Transport message id.
        message_id: String,
    },
    /// A delivery was abandoned and requeued.
    Abandoned {
        /// Channel name.
        channel: String,
        /// Transport message id.
        message_id: String,
    },
    /// A delivery was abandoned too often and moved to the dead-letter channel.
    DeadLettered {
        /// Channel the message came from.
        channel: String,
        /// Transport message id.
        message_id: String,
    },
}

#[derive(Clone, Debug)]
struct Queued {
    message: TransportMessage,
    delivery_count: u32,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Queued>>,
    journal: Vec<BrokerOperation>,
    unavailable: HashSet<String>,
}

/// Queue broker held entirely in memory.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
    max_deliveries: u32,
}

impl InMemoryBroker {
    /// Broker using wall-clock time for visibility.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Broker using `clock` for visibility.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            clock,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Set how many deliveries a message gets before it is dead-lettered.
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Make sends to `channel` fail (or succeed again).
    pub fn set_unavailable(&self, channel: &str, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(channel.to_string());
        } else {
            state.unavailable.remove(channel);
        }
    }

    /// Messages waiting on `channel`, visible or not. In-flight messages are excluded.
    #[must_use]
    pub fn pending(&self, channel: &str) -> Vec<TransportMessage> {
        self.lock()
            .queues
            .get(channel)
            .map(|queue| queue.iter().map(|queued| queued.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Pending messages on `channel` decoded as `M`. Undecodable bodies are skipped.
    #[must_use]
    pub fn pending_messages<M: Message>(&self, channel: &str) -> Vec<M> {
        self.pending(channel)
            .iter()
            .filter_map(|message| codec::decode::<M>(&message.body).ok())
            .collect()
    }

    /// Everything the broker has done so far.
    #[must_use]
    pub fn journal(&self) -> Vec<BrokerOperation> {
        self.lock().journal.clone()
    }

    /// Take the first message on `channel` that is visible now.
    #[must_use]
    pub fn receive(self: &Arc<Self>, channel: &str) -> Option<InMemoryDelivery> {
        let now = self.clock.now();
        let mut state = self.lock();
        let queue = state.queues.get_mut(channel)?;
        let position = queue
            .iter()
            .position(|queued| queued.message.is_visible_at(now))?;
        let mut queued = queue.remove(position)?;
        drop(state);

        queued.delivery_count += 1;
        Some(InMemoryDelivery {
            broker: Arc::clone(self),
            channel: channel.to_string(),
            queued,
            settled: AtomicBool::new(false),
        })
    }

    /// Take every message on `channel` that is visible now.
    #[must_use]
    pub fn drain(self: &Arc<Self>, channel: &str) -> Vec<InMemoryDelivery> {
        std::iter::from_fn(|| self.receive(channel)).collect()
    }

    /// Endless stream of deliveries from `channel`, polling while it is empty.
    pub fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        poll_interval: Duration,
    ) -> impl Stream<Item = Result<InMemoryDelivery, TransportError>> + Send + use<> {
        let broker = Arc::clone(self);
        let channel = channel.to_string();

        stream! {
            loop {
                match broker.receive(&channel) {
                    Some(delivery) => yield Ok(delivery),
                    None => tokio::time::sleep(poll_interval).await,
                }
            }
        }
    }

    fn enqueue(&self, channel: &str, queued: Queued) {
        let mut state = self.lock();
        let message_id = queued.message.message_id.clone();
        state
            .queues
            .entry(channel.to_string())
            .or_default()
            .push_back(queued);
        state.journal.push(BrokerOperation::Sent {
            channel: channel.to_string(),
            message_id,
        });
    }

    fn record(&self, operation: BrokerOperation) {
        self.lock().journal.push(operation);
    }

    fn requeue(&self, channel: &str, queued: Queued) {
        let message_id = queued.message.message_id.clone();

        if queued.delivery_count >= self.max_deliveries {
            self.record(BrokerOperation::DeadLettered {
                channel: channel.to_string(),
                message_id,
            });
            self.enqueue(
                &channels::dead_letter(channel),
                Queued {
                    message: queued.message,
                    delivery_count: 0,
                },
            );
            return;
        }

        let mut state = self.lock();
        state
            .queues
            .entry(channel.to_string())
            .or_default()
            .push_front(queued);
        state.journal.push(BrokerOperation::Abandoned {
            channel: channel.to_string(),
            message_id,
        });
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryBroker {
    fn send(
        &self,
        channel: &str,
        message: TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let channel = channel.to_string();
        Box::pin(async move {
            if self.lock().unavailable.contains(&channel) {
                return Err(TransportError::ChannelUnavailable {
                    channel,
                    reason: "channel marked unavailable".to_string(),
                });
            }

            self.enqueue(
                &channel,
                Queued {
                    message,
                    delivery_count: 0,
                },
            );
            Ok(())
        })
    }
}

/// A message taken from an [`InMemoryBroker`].
///
/// Settle it exactly once with [`Delivery::complete`] or [`Delivery::abandon`].
/// A delivery dropped unsettled is lost, like a message whose lock expired on
/// a broker that has no redelivery.
pub struct InMemoryDelivery {
    broker: Arc<InMemoryBroker>,
    channel: String,
    queued: Queued,
    settled: AtomicBool,
}

impl InMemoryDelivery {
    /// The transport message as delivered.
    #[must_use]
    pub const fn message(&self) -> &TransportMessage {
        &self.queued.message
    }

    fn settle(&self) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(TransportError::SettleFailed {
                message_id: self.queued.message.message_id.clone(),
                reason: "delivery already settled".to_string(),
            });
        }
        Ok(())
    }
}

impl Delivery for InMemoryDelivery {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn body(&self) -> Option<&[u8]> {
        Some(&self.queued.message.body)
    }

    fn correlation_id(&self) -> Option<&str> {
        Some(&self.queued.message.correlation_id)
    }

    fn message_id(&self) -> Option<&str> {
        Some(&self.queued.message.message_id)
    }

    fn delivery_count(&self) -> u32 {
        self.queued.delivery_count
    }

    fn complete(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.settle()?;
            self.broker.record(BrokerOperation::Completed {
                channel: self.channel.clone(),
                message_id: self.queued.message.message_id.clone(),
            });
            Ok(())
        })
    }

    fn abandon(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.settle()?;
            self.broker.requeue(&self.channel, self.queued.clone());
            Ok(())
        })
    }
}

/// A standalone delivery for calling a handler directly.
///
/// Counts how it was settled instead of talking to a broker.
#[derive(Debug)]
pub struct StubDelivery {
    channel: String,
    body: Option<Vec<u8>>,
    correlation_id: Option<String>,
    message_id: Option<String>,
    delivery_count: u32,
    completions: AtomicUsize,
    abandonments: AtomicUsize,
    fail_completion: AtomicBool,
}

impl StubDelivery {
    /// Delivery on `channel` carrying `body` and no envelope metadata.
    #[must_use]
    pub fn new(channel: &str, body: Option<Vec<u8>>) -> Self {
        Self {
            channel: channel.to_string(),
            body,
            correlation_id: None,
            message_id: None,
            delivery_count: 1,
            completions: AtomicUsize::new(0),
            abandonments: AtomicUsize::new(0),
            fail_completion: AtomicBool::new(false),
        }
    }

    /// Delivery of `message` with the envelope a publisher would have built.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be encoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn for_message<M: Message>(channel: &str, message: &M) -> Self {
        let outgoing = envelope(message, None).expect("test message should encode");
        Self {
            correlation_id: Some(outgoing.correlation_id),
            message_id: Some(outgoing.message_id),
            ..Self::new(channel, Some(outgoing.body))
        }
    }

    /// Override the envelope correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_string);
        self
    }

    /// Make [`Delivery::complete`] fail.
    #[must_use]
    pub fn failing_completion(self) -> Self {
        self.fail_completion.store(true, Ordering::SeqCst);
        self
    }

    /// Number of successful completions.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Number of abandonments.
    #[must_use]
    pub fn abandonments(&self) -> usize {
        self.abandonments.load(Ordering::SeqCst)
    }
}

impl Delivery for StubDelivery {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn complete(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_completion.load(Ordering::SeqCst) {
                return Err(TransportError::SettleFailed {
                    message_id: self.message_id.clone().unwrap_or_default(),
                    reason: "completion set to fail".to_string(),
                });
            }
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn abandon(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.abandonments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{ManualClock, test_clock};
    use chrono::TimeDelta;
    use futures::StreamExt;

    fn message(id: &str, at: Option<chrono::DateTime<chrono::Utc>>) -> TransportMessage {
        TransportMessage {
            body: br#"{"orderId":"ABC123"}"#.to_vec(),
            content_type: "application/json".to_string(),
            correlation_id: "corr".to_string(),
            message_id: id.to_string(),
            scheduled_enqueue_time_utc: at,
        }
    }

    #[tokio::test]
    async fn deferred_messages_wait_for_their_instant() {
        let start = test_clock().now();
        let clock = Arc::new(ManualClock::new(start));
        let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));

        broker
            .send("q", message("later", Some(start + TimeDelta::seconds(10))))
            .await
            .unwrap();
        broker.send("q", message("now", None)).await.unwrap();

        let first = broker.receive("q").unwrap();
        assert_eq!(first.message_id(), Some("now"));
        assert!(broker.receive("q").is_none());

        clock.advance(TimeDelta::seconds(10));
        assert_eq!(broker.receive("q").unwrap().message_id(), Some("later"));
    }

    #[tokio::test]
    async fn abandoned_messages_are_redelivered_then_dead_lettered() {
        let broker = Arc::new(InMemoryBroker::new().with_max_deliveries(2));
        broker.send("q", message("m", None)).await.unwrap();

        let first = broker.receive("q").unwrap();
        assert_eq!(first.delivery_count(), 1);
        first.abandon().await.unwrap();

        let second = broker.receive("q").unwrap();
        assert_eq!(second.delivery_count(), 2);
        second.abandon().await.unwrap();

        assert!(broker.receive("q").is_none());
        assert_eq!(broker.pending("q/$DeadLetterQueue").len(), 1);
        assert!(broker.journal().contains(&BrokerOperation::DeadLettered {
            channel: "q".to_string(),
            message_id: "m".to_string(),
        }));
    }

    #[tokio::test]
    async fn deliveries_settle_once() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.send("q", message("m", None)).await.unwrap();

        let delivery = broker.receive("q").unwrap();
        delivery.complete().await.unwrap();
        assert!(delivery.complete().await.is_err());
        assert!(delivery.abandon().await.is_err());
    }

    #[tokio::test]
    async fn unavailable_channels_reject_sends() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable("q", true);
        assert!(broker.send("q", message("m", None)).await.is_err());

        broker.set_unavailable("q", false);
        assert!(broker.send("q", message("m", None)).await.is_ok());
    }

    #[tokio::test]
    async fn subscription_yields_queued_messages() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.send("q", message("a", None)).await.unwrap();
        broker.send("q", message("b", None)).await.unwrap();

        let ids: Vec<String> = broker
            .subscribe("q", Duration::from_millis(5))
            .take(2)
            .map(|delivery| delivery.unwrap().message_id().unwrap().to_string())
            .collect()
            .await;

        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stub_delivery_counts_settlements() {
        let stub = StubDelivery::new("q", None).failing_completion();
        assert!(stub.complete().await.is_err());
        stub.abandon().await.unwrap();

        assert_eq!(stub.completions(), 0);
        assert_eq!(stub.abandonments(), 1);
        assert!(stub.body().is_none());
    }
}
