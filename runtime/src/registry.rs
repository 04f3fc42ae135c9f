//! Publisher registry keyed by message type.
//!
//! Handlers ask the registry for "the publisher of `M`" instead of being handed
//! each publisher individually. The registry is filled once at start-up, either
//! from the standard channel table ([`PublisherRegistry::standard`]) or by
//! explicit [`register`](PublisherRegistry::register) calls, and is read-only
//! afterwards.
//!
//! ## Example
//!
//! ```ignore
//! let registry = PublisherRegistry::standard(transport, &ChannelNames::default())?;
//! let publisher = registry.publisher::<ProcessOrder>()?;
//! publisher.publish(&command, None).await?;
//! ```

use order_fulfillment_core::channels::ChannelNames;
use order_fulfillment_core::message::{
    FulfillmentEvent, Message, NotifyOfFatalFailure, ProcessOrder, SubmitOrderForProduction,
};
use order_fulfillment_core::publisher::{ChannelPublisher, Publisher};
use order_fulfillment_core::transport::Transport;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from registering or looking up publishers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A publisher for the message type is already registered.
    #[error("A publisher for {message_type} is already registered")]
    AlreadyRegistered {
        /// Message type name.
        message_type: &'static str,
    },

    /// No publisher is registered for the message type.
    #[error("No publisher is registered for {message_type}")]
    NotRegistered {
        /// Message type name.
        message_type: &'static str,
    },

    /// The registered publisher handles a different type with the same name.
    #[error("The publisher registered as {message_type} handles a different type")]
    TypeMismatch {
        /// Message type name.
        message_type: &'static str,
    },
}

/// Maps message types to their publishers.
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl PublisherRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a channel publisher for every fulfillment message type.
    ///
    /// | Message type | Channel |
    /// |---|---|
    /// | `ProcessOrder` | `channels.process_order` |
    /// | `SubmitOrderForProduction` | `channels.submit_order` |
    /// | `NotifyOfFatalFailure` | `channels.notify_fatal_failure` |
    /// | `FulfillmentEvent` | `channels.events` |
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] only if the table itself registers a type twice.
    pub fn standard(
        transport: &Arc<dyn Transport>,
        channels: &ChannelNames,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register_channel::<ProcessOrder>(transport, &channels.process_order)?;
        registry.register_channel::<SubmitOrderForProduction>(transport, &channels.submit_order)?;
        registry.register_channel::<NotifyOfFatalFailure>(transport, &channels.notify_fatal_failure)?;
        registry.register_channel::<FulfillmentEvent>(transport, &channels.events)?;
        Ok(registry)
    }

    /// Register `publisher` for messages of type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `M` already has one.
    pub fn register<M: Message>(
        &mut self,
        publisher: Arc<dyn Publisher<M>>,
    ) -> Result<(), RegistryError> {
        if self.publishers.contains_key(M::TYPE) {
            return Err(RegistryError::AlreadyRegistered {
                message_type: M::TYPE,
            });
        }

        self.publishers.insert(M::TYPE, Arc::new(publisher));
        tracing::debug!(message_type = M::TYPE, "Publisher registered");
        Ok(())
    }

    /// Register a [`ChannelPublisher`] sending `M` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `M` already has one.
    pub fn register_channel<M: Message>(
        &mut self,
        transport: &Arc<dyn Transport>,
        channel: &str,
    ) -> Result<(), RegistryError> {
        self.register::<M>(Arc::new(ChannelPublisher::<M>::new(
            Arc::clone(transport),
            channel,
        )))
    }

    /// Publisher for messages of type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if nothing was registered for `M`.
    pub fn publisher<M: Message>(&self) -> Result<Arc<dyn Publisher<M>>, RegistryError> {
        let entry = self
            .publishers
            .get(M::TYPE)
            .ok_or(RegistryError::NotRegistered {
                message_type: M::TYPE,
            })?;

        entry
            .downcast_ref::<Arc<dyn Publisher<M>>>()
            .cloned()
            .ok_or(RegistryError::TypeMismatch {
                message_type: M::TYPE,
            })
    }

    /// Names of the registered message types, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.publishers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use order_fulfillment_testing::{InMemoryBroker, RecordingPublisher};

    #[test]
    fn standard_table_covers_every_message_type() {
        let broker: Arc<dyn Transport> = Arc::new(InMemoryBroker::new());
        let registry = PublisherRegistry::standard(&broker, &ChannelNames::default()).unwrap();

        assert_eq!(
            registry.registered_types(),
            vec![
                "FulfillmentEvent",
                "NotifyOfFatalFailure",
                "ProcessOrder",
                "SubmitOrderForProduction",
            ]
        );
        assert!(registry.publisher::<ProcessOrder>().is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PublisherRegistry::new();
        registry
            .register::<ProcessOrder>(Arc::new(RecordingPublisher::<ProcessOrder>::new()))
            .unwrap();

        let error = registry
            .register::<ProcessOrder>(Arc::new(RecordingPublisher::<ProcessOrder>::new()))
            .unwrap_err();
        assert_eq!(
            error,
            RegistryError::AlreadyRegistered {
                message_type: "ProcessOrder"
            }
        );
    }

    #[test]
    fn missing_publisher_is_reported() {
        let registry = PublisherRegistry::new();
        let error = registry.publisher::<NotifyOfFatalFailure>().err().unwrap();
        assert_eq!(
            error,
            RegistryError::NotRegistered {
                message_type: "NotifyOfFatalFailure"
            }
        );
    }

    #[tokio::test]
    async fn looked_up_publisher_is_the_registered_one() {
        let recording = Arc::new(RecordingPublisher::<SubmitOrderForProduction>::new());
        let mut registry = PublisherRegistry::new();
        registry
            .register::<SubmitOrderForProduction>(recording.clone())
            .unwrap();

        let publisher = registry.publisher::<SubmitOrderForProduction>().unwrap();
        publisher
            .publish(&SubmitOrderForProduction::default(), None)
            .await
            .unwrap();

        assert_eq!(recording.published().len(), 1);
    }
}
