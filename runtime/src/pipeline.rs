//! The command handling pipeline.
//!
//! One [`CommandPipeline`] exists per command type. It drives a delivery
//! through the same state machine whatever the command:
//!
//! ```text
//!  Received ──▶ Deserialized ──▶ DomainInvoked ──┬──▶ Chained & Completed
//!     │              │                           ├──▶ RetryScheduled & Completed
//!     ▼              ▼                           └──▶ Escalated & Failed
//!  MissingBody   Malformed / MissingDependency
//! ```
//!
//! What differs between command types (the domain operation, the follow-on
//! command, the events) is supplied by a [`CommandWorkflow`].
//!
//! # Failure normalization
//!
//! A domain operation can fail by returning a non-success
//! [`OperationResult`](order_fulfillment_core::operation::OperationResult) or
//! by returning an [`OperationError`](order_fulfillment_core::domain::OperationError).
//! Both are turned into a [`HandlingOutcome`] before the retry decision, and an
//! error is treated as a retriable failure. Errors raised while chaining or
//! completing after a success take the same path.
//!
//! # Acknowledgement
//!
//! The delivery is completed on success and after a retry was published. On
//! escalation the handler returns [`HandlerError::FailedToHandle`] and leaves
//! the delivery unsettled, so the broker's own redelivery and dead-lettering
//! take over.

use crate::correlation::{handling_span, record_correlation_id, resolve_correlation_id};
use crate::ledger::{DeliveryKey, DeliveryLedger};
use crate::metrics::PipelineMetrics;
use crate::registry::{PublisherRegistry, RegistryError};
use crate::retry::RetryScheduler;
use order_fulfillment_core::codec::{self, CodecError};
use order_fulfillment_core::domain::{OperationError, OperationFuture};
use order_fulfillment_core::environment::Clock;
use order_fulfillment_core::message::{
    Command, Event, FulfillmentEvent, Message, NotifyOfFatalFailure, OrderScoped,
};
use order_fulfillment_core::operation::HandlingOutcome;
use order_fulfillment_core::publisher::{PublishError, Publisher};
use order_fulfillment_core::transport::{Delivery, TransportError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Span};
use uuid::Uuid;

/// Why handling a delivery did not succeed.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The delivery carried no body.
    #[error("The delivery on '{channel}' carried no message body")]
    MissingBody {
        /// Channel the delivery came from.
        channel: String,
    },

    /// The body was not valid JSON for the command.
    #[error("The {command_type} body could not be decoded: {source}")]
    Malformed {
        /// Expected command type.
        command_type: &'static str,
        /// Decoder error.
        #[source]
        source: CodecError,
    },

    /// The body decoded to an empty command.
    #[error("No {command_type} could be read from the message body")]
    MissingDependency {
        /// Expected command type.
        command_type: &'static str,
    },

    /// The command failed and was escalated. Already logged.
    #[error("Failed to handle the {command_type} command: {reason}")]
    FailedToHandle {
        /// Command type.
        command_type: &'static str,
        /// Failure reason of the last attempt.
        reason: String,
    },

    /// A message that had to be published could not be.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The transport could not settle the delivery.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A domain operation raised an error that is not retried here.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl HandlerError {
    /// Whether this is the escalation marker.
    ///
    /// The marker means every log line and notification has already been
    /// emitted; callers should pass it on without logging it again.
    #[must_use]
    pub const fn is_escalation(&self) -> bool {
        matches!(self, Self::FailedToHandle { .. })
    }

    /// Metric label for how handling ended.
    #[must_use]
    pub const fn result_label(&self) -> &'static str {
        if self.is_escalation() {
            "escalated"
        } else {
            "rejected"
        }
    }
}

/// How a successfully handled delivery was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The command succeeded and the delivery was completed.
    Completed,
    /// A retry was published and the delivery was completed.
    RetryScheduled {
        /// Attempt count carried by the published retry.
        attempt: u32,
    },
    /// The delivery repeated one that already succeeded and was completed unhandled.
    Duplicate,
}

impl Disposition {
    /// Metric label for how handling ended.
    #[must_use]
    pub const fn result_label(self) -> &'static str {
        match self {
            Self::Completed => "success",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Something that handles deliveries from one or more channels.
pub trait DeliveryHandler: Send + Sync {
    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the delivery was not settled successfully
    /// and should be left to the broker.
    fn handle<'a>(
        &'a self,
        delivery: &'a dyn Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<Disposition, HandlerError>> + Send + 'a>>;
}

/// The parts of command handling that differ per command type.
pub trait CommandWorkflow: Send + Sync + 'static {
    /// Command handled.
    type Command: Command + OrderScoped + Default;
    /// Event announced after success.
    type SuccessEvent: Event + OrderScoped + Default + Into<FulfillmentEvent>;
    /// Event announced after an error or escalation.
    type FailureEvent: Event + OrderScoped + Default + Into<FulfillmentEvent>;

    /// Invoke the domain operation for `command`.
    fn invoke<'a>(
        &'a self,
        command: &'a Self::Command,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a>;

    /// Publish what a successful `command` leads to.
    ///
    /// Failure here is surfaced, not swallowed.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the follow-on message could not be published.
    fn chain<'a>(
        &'a self,
        command: &'a Self::Command,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        let _ = (command, payload);
        Box::pin(async { Ok(()) })
    }

    /// Whether giving up publishes a [`NotifyOfFatalFailure`] command.
    fn escalates(&self) -> bool {
        true
    }
}

/// Shared dependencies of every pipeline in a process.
#[derive(Clone)]
pub struct PipelineEnvironment {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Retry scheduler shared by all pipelines.
    pub scheduler: Arc<RetryScheduler>,
    /// Publishers by message type.
    pub registry: Arc<PublisherRegistry>,
    /// Record of completed deliveries, if duplicate suppression is wanted.
    pub ledger: Option<Arc<dyn DeliveryLedger>>,
}

/// Handles deliveries of one command type.
pub struct CommandPipeline<W: CommandWorkflow> {
    workflow: W,
    clock: Arc<dyn Clock>,
    scheduler: Arc<RetryScheduler>,
    retries: Arc<dyn Publisher<W::Command>>,
    notifications: Arc<dyn Publisher<NotifyOfFatalFailure>>,
    events: Arc<dyn Publisher<FulfillmentEvent>>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
}

impl<W: CommandWorkflow> CommandPipeline<W> {
    /// Create a pipeline for `workflow`, taking publishers from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if the registry lacks a
    /// publisher for the command, for `NotifyOfFatalFailure`, or for events.
    pub fn new(workflow: W, environment: &PipelineEnvironment) -> Result<Self, RegistryError> {
        Ok(Self {
            workflow,
            clock: Arc::clone(&environment.clock),
            scheduler: Arc::clone(&environment.scheduler),
            retries: environment.registry.publisher::<W::Command>()?,
            notifications: environment.registry.publisher::<NotifyOfFatalFailure>()?,
            events: environment.registry.publisher::<FulfillmentEvent>()?,
            ledger: environment.ledger.clone(),
        })
    }

    /// The workflow this pipeline drives.
    #[must_use]
    pub const fn workflow(&self) -> &W {
        &self.workflow
    }

    /// Handle one delivery of `W::Command`.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::MissingBody`], [`HandlerError::Malformed`] or
    ///   [`HandlerError::MissingDependency`] when no command could be read
    /// - [`HandlerError::FailedToHandle`] when the command was escalated
    /// - [`HandlerError::Publish`] when a retry could not be published
    /// - [`HandlerError::Transport`] when a retried delivery could not be completed
    pub async fn handle(&self, delivery: &dyn Delivery) -> Result<Disposition, HandlerError> {
        let command_type = W::Command::TYPE;
        let span = handling_span(command_type, delivery.channel(), delivery.message_id());
        record_correlation_id(&span, delivery.correlation_id());

        let result = self
            .handle_delivery(delivery, &span)
            .instrument(span.clone())
            .await;

        let label = match &result {
            Ok(disposition) => disposition.result_label(),
            Err(error) => error.result_label(),
        };
        PipelineMetrics::record_completed(command_type, label);
        result
    }

    async fn handle_delivery(
        &self,
        delivery: &dyn Delivery,
        span: &Span,
    ) -> Result<Disposition, HandlerError> {
        let command_type = W::Command::TYPE;

        let Some(body) = delivery.body() else {
            tracing::error!("The delivery carried no message body");
            return Err(HandlerError::MissingBody {
                channel: delivery.channel().to_string(),
            });
        };

        let mut command = self.decode(body, delivery.correlation_id()).await?;
        command.header_mut().local_received_time_utc = Some(self.clock.now());
        PipelineMetrics::record_received(command_type);

        let correlation_id =
            resolve_correlation_id(command.correlation_id(), delivery.correlation_id());
        record_correlation_id(span, correlation_id.as_deref());
        if command.correlation_id().is_none_or(str::is_empty) {
            // Everything derived from the command inherits the envelope's id.
            command.header_mut().correlation_id.clone_from(&correlation_id);
        }

        tracing::info!(
            attempts = command.previous_attempts(),
            delivery_count = delivery.delivery_count(),
            "A {command_type} command was received and is being handled."
        );

        let key = DeliveryKey::of(&command);
        if let (Some(ledger), Some(key)) = (&self.ledger, &key) {
            if ledger.is_completed(key) {
                tracing::info!("The {command_type} command was already handled; completing the duplicate.");
                delivery.complete().await?;
                return Ok(Disposition::Duplicate);
            }
        }

        let mut failure_event_published = false;
        let outcome = match self.workflow.invoke(&command, correlation_id.as_deref()).await {
            Ok(result) => HandlingOutcome::from(result),
            Err(error) => {
                tracing::error!(error = %error, "An exception occurred while handling the {command_type} command.");
                self.publish_failure_event(&command).await;
                failure_event_published = true;
                HandlingOutcome::exception()
            }
        };

        let failure = match outcome {
            HandlingOutcome::Success(payload) => {
                match self.complete_success(&command, &payload, delivery).await {
                    Ok(()) => {
                        if let (Some(ledger), Some(key)) = (&self.ledger, key) {
                            ledger.record_completed(key);
                        }
                        return Ok(Disposition::Completed);
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "An exception occurred after the {command_type} command was handled.");
                        if !failure_event_published {
                            self.publish_failure_event(&command).await;
                            failure_event_published = true;
                        }
                        HandlingOutcome::exception()
                    }
                }
            }
            failure => failure,
        };

        self.retry_or_escalate(command, &failure, delivery, failure_event_published)
            .await
    }

    /// Decode the body, reporting an unreadable one.
    async fn decode(
        &self,
        body: &[u8],
        envelope_correlation_id: Option<&str>,
    ) -> Result<W::Command, HandlerError> {
        let command_type = W::Command::TYPE;

        let error = match codec::decode::<W::Command>(body) {
            Ok(command) if !command.is_empty() => return Ok(command),
            Ok(_) => HandlerError::MissingDependency { command_type },
            Err(source) => HandlerError::Malformed {
                command_type,
                source,
            },
        };

        tracing::error!(
            error = %error,
            body = %codec::body_preview(body),
            "The {command_type} command could not be read from the message body."
        );
        self.publish_unreadable_failure_event(envelope_correlation_id)
            .await;
        Err(error)
    }

    async fn complete_success(
        &self,
        command: &W::Command,
        payload: &str,
        delivery: &dyn Delivery,
    ) -> Result<(), HandlerError> {
        self.workflow.chain(command, payload).await?;
        delivery.complete().await?;

        let event: FulfillmentEvent = command.derive_event::<W::SuccessEvent>().into();
        self.publish_event(&event).await;

        tracing::info!(
            payload,
            "The {} command was successfully handled.",
            W::Command::TYPE
        );
        Ok(())
    }

    async fn retry_or_escalate(
        &self,
        mut command: W::Command,
        failure: &HandlingOutcome,
        delivery: &dyn Delivery,
        failure_event_published: bool,
    ) -> Result<Disposition, HandlerError> {
        let command_type = W::Command::TYPE;
        let reason = failure.reason().unwrap_or_default().to_string();

        tracing::warn!(
            reason = %reason,
            final_failure = failure.is_final(),
            attempts = command.previous_attempts(),
            "The {command_type} command was not successfully handled."
        );

        if !failure.is_final() {
            match self
                .scheduler
                .schedule_retry_if_eligible(&mut command, self.retries.as_ref())
                .await
            {
                Ok(true) => {
                    delivery.complete().await?;
                    return Ok(Disposition::RetryScheduled {
                        attempt: command.previous_attempts(),
                    });
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(error = %error, "The retry could not be published; leaving the delivery to the broker.");
                    return Err(HandlerError::Publish(error));
                }
            }
        }

        if !failure_event_published {
            self.publish_failure_event(&command).await;
        }

        if self.workflow.escalates() {
            let notice: NotifyOfFatalFailure = command.derive_command();
            if !self.notifications.try_publish(&notice, None).await {
                PipelineMetrics::record_best_effort_failure(NotifyOfFatalFailure::TYPE);
            }
        }

        PipelineMetrics::record_escalation(command_type);
        tracing::error!(
            reason = %reason,
            attempts = command.previous_attempts(),
            max_count = self.scheduler.thresholds().max_count,
            "The {command_type} command could not be handled and will not be retried."
        );

        Err(HandlerError::FailedToHandle {
            command_type,
            reason,
        })
    }

    /// Publish the workflow's failure event without letting it fail the handler.
    async fn publish_failure_event(&self, command: &W::Command) {
        let event = command.derive_event::<W::FailureEvent>();
        self.publish_event(&event.into()).await;
    }

    /// Publish a minimal failure event when no command could be read.
    ///
    /// The event carries only the envelope's correlation id.
    async fn publish_unreadable_failure_event(&self, correlation_id: Option<&str>) {
        let mut event = W::FailureEvent::default();
        let header = event.header_mut();
        header.id = Uuid::new_v4();
        header.occurred_time_utc = self.clock.now();
        header.correlation_id = correlation_id.map(str::to_string);

        self.publish_event(&event.into()).await;
    }

    async fn publish_event(&self, event: &FulfillmentEvent) {
        if !self.events.try_publish(event, None).await {
            PipelineMetrics::record_best_effort_failure(event.message_type());
        }
    }
}

impl<W: CommandWorkflow> DeliveryHandler for CommandPipeline<W> {
    fn handle<'a>(
        &'a self,
        delivery: &'a dyn Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<Disposition, HandlerError>> + Send + 'a>> {
        Box::pin(Self::handle(self, delivery))
    }
}
