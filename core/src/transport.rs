//! The narrow contract between the pipeline and a message broker.
//!
//! Publishers reach the broker only through [`Transport::send`], and handlers
//! see inbound messages only as [`Delivery`] values. Concrete brokers (the
//! Kafka transport, the in-memory broker used by tests) implement both sides.
//!
//! # Visibility
//!
//! A [`TransportMessage`] with a `scheduled_enqueue_time_utc` must not be
//! handed to consumers before that instant. This is how retry backoff is
//! realized: the retry is published immediately but becomes visible later.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel could not be reached.
    #[error("Channel '{channel}' is unavailable: {reason}")]
    ChannelUnavailable {
        /// Logical channel name.
        channel: String,
        /// Underlying cause.
        reason: String,
    },

    /// The broker rejected or failed to accept a message.
    #[error("Failed to send to channel '{channel}': {reason}")]
    SendFailed {
        /// Logical channel name.
        channel: String,
        /// Underlying cause.
        reason: String,
    },

    /// An inbound message could not be settled (completed or abandoned).
    #[error("Failed to settle message '{message_id}': {reason}")]
    SettleFailed {
        /// Transport message identifier.
        message_id: String,
        /// Underlying cause.
        reason: String,
    },

    /// Subscribing to a channel failed.
    #[error("Failed to subscribe to '{channel}': {reason}")]
    SubscriptionFailed {
        /// Logical channel name.
        channel: String,
        /// Underlying cause.
        reason: String,
    },
}

/// An outgoing message together with its broker metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    /// Encoded message body.
    pub body: Vec<u8>,
    /// Content type of `body`.
    pub content_type: String,
    /// Correlation identifier; never empty.
    pub correlation_id: String,
    /// Message identifier; equal to the message's own id.
    pub message_id: String,
    /// Earliest instant at which consumers may see the message.
    pub scheduled_enqueue_time_utc: Option<DateTime<Utc>>,
}

impl TransportMessage {
    /// Whether consumers may see the message at `now`.
    #[must_use]
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_enqueue_time_utc.is_none_or(|at| at <= now)
    }
}

/// Sends messages to named channels.
///
/// Implementations own a long-lived client, created on first use and reused
/// for every send.
pub trait Transport: Send + Sync {
    /// Send `message` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the channel is unavailable or the
    /// broker does not accept the message.
    fn send(
        &self,
        channel: &str,
        message: TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// An inbound message handed to a handler.
pub trait Delivery: Send + Sync {
    /// Channel the message was received from.
    fn channel(&self) -> &str;

    /// Message body, if the broker delivered one.
    fn body(&self) -> Option<&[u8]>;

    /// Correlation identifier from the broker envelope.
    fn correlation_id(&self) -> Option<&str>;

    /// Message identifier from the broker envelope.
    fn message_id(&self) -> Option<&str>;

    /// How many times the broker has delivered this message, starting at 1.
    fn delivery_count(&self) -> u32;

    /// Acknowledge the message so the broker does not deliver it again.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SettleFailed`] if the broker cannot be told.
    fn complete(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Give the message back to the broker for redelivery or dead-lettering.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SettleFailed`] if the broker cannot be told.
    fn abandon(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}
