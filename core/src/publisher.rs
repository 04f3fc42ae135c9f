//! Publishing commands and events to channels.
//!
//! [`Publisher`] is the contract every call site in the pipeline uses.
//! [`ChannelPublisher`] implements it on top of a [`Transport`] by encoding the
//! message as JSON and building the broker envelope.
//!
//! Two flavours of publishing exist:
//!
//! - [`Publisher::publish`] reports failure to the caller. Used where a lost
//!   message is an inconsistency the handler must surface (follow-on commands,
//!   retries).
//! - [`Publisher::try_publish`] never fails. Errors are logged and reported as
//!   `false`. Used for secondary messages (events, escalation notices) so they
//!   cannot change the outcome of handling.

use crate::codec::{self, CONTENT_TYPE_JSON, CodecError};
use crate::message::Message;
use crate::transport::{Transport, TransportError, TransportMessage};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors from publishing a message.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The transport could not accept the message.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Publishes messages of type `M`.
pub trait Publisher<M: Message>: Send + Sync {
    /// Publish `message`, visible immediately or no earlier than `defer_until`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the message cannot be encoded or the
    /// channel is unavailable.
    fn publish<'a>(
        &'a self,
        message: &'a M,
        defer_until: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

    /// Publish `message` without propagating failure.
    ///
    /// Returns `true` if the message was published. On failure the error is
    /// logged and `false` is returned.
    fn try_publish<'a>(
        &'a self,
        message: &'a M,
        defer_until: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.publish(message, defer_until).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::error!(
                        message_type = message.message_type(),
                        message_id = %message.id(),
                        correlation_id = message.correlation_id().unwrap_or_default(),
                        error = %error,
                        "Unable to publish message; continuing without it"
                    );
                    false
                }
            }
        })
    }
}

/// Build the broker envelope for `message`.
///
/// The correlation id is the message's own, or a fresh one if it has none.
/// The message id is the message's id.
///
/// # Errors
///
/// Returns [`CodecError`] if the message cannot be encoded.
pub fn envelope<M: Message>(
    message: &M,
    defer_until: Option<DateTime<Utc>>,
) -> Result<TransportMessage, CodecError> {
    let correlation_id = message
        .correlation_id()
        .filter(|id| !id.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    Ok(TransportMessage {
        body: codec::encode(message)?,
        content_type: CONTENT_TYPE_JSON.to_string(),
        correlation_id,
        message_id: message.id().to_string(),
        scheduled_enqueue_time_utc: defer_until,
    })
}

/// A [`Publisher`] that sends every message to one named channel.
pub struct ChannelPublisher<M> {
    transport: Arc<dyn Transport>,
    channel: String,
    _message: PhantomData<fn(M)>,
}

impl<M> ChannelPublisher<M> {
    /// Create a publisher for `channel` over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
            _message: PhantomData,
        }
    }

    /// Channel this publisher sends to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<M: Message> Publisher<M> for ChannelPublisher<M> {
    fn publish<'a>(
        &'a self,
        message: &'a M,
        defer_until: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            let outgoing = envelope(message, defer_until)?;
            self.transport.send(&self.channel, outgoing).await?;

            tracing::debug!(
                channel = %self.channel,
                message_type = message.message_type(),
                message_id = %message.id(),
                deferred_until = ?defer_until,
                "Message published"
            );
            Ok(())
        })
    }
}
