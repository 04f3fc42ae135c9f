//! Handler for the dead-letter channels of the command channels.
//!
//! Anything that lands on a dead-letter channel is reported to operators once.
//! The handler reads only the fields every order command shares, so the same
//! instance serves all three dead-letter channels. Dead-lettered messages are
//! never retried through the scheduler.

use crate::correlation::{handling_span, record_correlation_id, resolve_correlation_id};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{DeliveryHandler, Disposition, HandlerError};
use crate::registry::{PublisherRegistry, RegistryError};
use order_fulfillment_core::codec;
use order_fulfillment_core::domain::Notifier;
use order_fulfillment_core::environment::Clock;
use order_fulfillment_core::message::{
    FulfillmentEvent, Message, NotificationFailed, NotificationSent, OrderCommand, OrderScoped,
};
use order_fulfillment_core::operation::HandlingOutcome;
use order_fulfillment_core::publisher::Publisher;
use order_fulfillment_core::transport::Delivery;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{Instrument, Span};
use uuid::Uuid;

/// Reports dead-lettered order commands.
pub struct DeadLetterHandler {
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn Publisher<FulfillmentEvent>>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterHandler {
    /// Create the handler, taking the event publisher from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if no event publisher is registered.
    pub fn new(
        notifier: Arc<dyn Notifier>,
        registry: &PublisherRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            notifier,
            events: registry.publisher::<FulfillmentEvent>()?,
            clock,
        })
    }

    /// Handle one dead-lettered delivery.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::MissingBody`], [`HandlerError::Malformed`] or
    ///   [`HandlerError::MissingDependency`] when no order command could be read
    /// - [`HandlerError::FailedToHandle`] when the notifier reported a failure
    /// - [`HandlerError::Operation`] when the notifier raised an error
    /// - [`HandlerError::Transport`] when the delivery could not be completed
    pub async fn handle(&self, delivery: &dyn Delivery) -> Result<Disposition, HandlerError> {
        let span = handling_span(OrderCommand::TYPE, delivery.channel(), delivery.message_id());
        record_correlation_id(&span, delivery.correlation_id());

        let result = self
            .handle_delivery(delivery, &span)
            .instrument(span.clone())
            .await;

        let label = match &result {
            Ok(disposition) => disposition.result_label(),
            Err(error) => error.result_label(),
        };
        PipelineMetrics::record_completed(OrderCommand::TYPE, label);
        result
    }

    async fn handle_delivery(
        &self,
        delivery: &dyn Delivery,
        span: &Span,
    ) -> Result<Disposition, HandlerError> {
        let location = delivery.channel();

        let Some(body) = delivery.body() else {
            tracing::error!("The dead-lettered delivery carried no message body");
            return Err(HandlerError::MissingBody {
                channel: location.to_string(),
            });
        };

        let command = match codec::decode::<OrderCommand>(body) {
            Ok(command) if !command.is_empty() => command,
            decoded => {
                let error = match decoded {
                    Ok(_) => HandlerError::MissingDependency {
                        command_type: OrderCommand::TYPE,
                    },
                    Err(source) => HandlerError::Malformed {
                        command_type: OrderCommand::TYPE,
                        source,
                    },
                };
                tracing::error!(
                    error = %error,
                    body = %codec::body_preview(body),
                    "The dead-lettered message could not be read."
                );
                self.publish_event(self.synthesized_failure(delivery.correlation_id()))
                    .await;
                return Err(error);
            }
        };
        PipelineMetrics::record_received(OrderCommand::TYPE);

        let correlation_id =
            resolve_correlation_id(command.correlation_id(), delivery.correlation_id());
        record_correlation_id(span, correlation_id.as_deref());
        tracing::info!(location, "A dead-lettered order message was received.");

        let order = command.order();
        let result = self
            .notifier
            .notify_dead_letter_message(
                location,
                order.partner_code.as_deref().unwrap_or_default(),
                order.order_id.as_deref().unwrap_or_default(),
                correlation_id.as_deref(),
            )
            .await;

        match result.map(HandlingOutcome::from) {
            Ok(HandlingOutcome::Success(_)) => {
                delivery.complete().await?;
                let sent: NotificationSent = command.derive_event();
                self.publish_event(sent.into()).await;
                tracing::info!(location, "The dead-lettered order message was reported.");
                Ok(Disposition::Completed)
            }
            Ok(failure) => {
                let reason = failure.reason().unwrap_or_default().to_string();
                tracing::error!(reason = %reason, location, "The dead-lettered order message could not be reported.");
                Err(HandlerError::FailedToHandle {
                    command_type: OrderCommand::TYPE,
                    reason,
                })
            }
            Err(error) => {
                tracing::error!(error = %error, location, "An exception occurred while reporting the dead-lettered order message.");
                let failed: NotificationFailed = command.derive_event();
                self.publish_event(failed.into()).await;
                Err(HandlerError::Operation(error))
            }
        }
    }

    fn synthesized_failure(&self, correlation_id: Option<&str>) -> FulfillmentEvent {
        let mut event = NotificationFailed::default();
        event.header.id = Uuid::new_v4();
        event.header.occurred_time_utc = self.clock.now();
        event.header.correlation_id = correlation_id.map(str::to_string);
        event.into()
    }

    async fn publish_event(&self, event: FulfillmentEvent) {
        if !self.events.try_publish(&event, None).await {
            PipelineMetrics::record_best_effort_failure(event.message_type());
        }
    }
}

impl DeliveryHandler for DeadLetterHandler {
    fn handle<'a>(
        &'a self,
        delivery: &'a dyn Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<Disposition, HandlerError>> + Send + 'a>> {
        Box::pin(Self::handle(self, delivery))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use order_fulfillment_core::domain::OperationError;
    use order_fulfillment_core::message::{ProcessOrder, SubmitOrderForProduction};
    use order_fulfillment_core::operation::OperationResult;
    use order_fulfillment_testing::{RecordingPublisher, ScriptedDomain, StubDelivery, test_clock};

    struct Fixture {
        domain: Arc<ScriptedDomain>,
        events: Arc<RecordingPublisher<FulfillmentEvent>>,
        handler: DeadLetterHandler,
    }

    fn fixture() -> Fixture {
        let domain = Arc::new(ScriptedDomain::new());
        let events = Arc::new(RecordingPublisher::<FulfillmentEvent>::new());
        let mut registry = PublisherRegistry::new();
        registry
            .register::<FulfillmentEvent>(events.clone())
            .unwrap();
        let handler =
            DeadLetterHandler::new(domain.clone(), &registry, Arc::new(test_clock())).unwrap();
        Fixture {
            domain,
            events,
            handler,
        }
    }

    fn dead_lettered() -> SubmitOrderForProduction {
        let mut parent = ProcessOrder::default();
        parent.header_mut().correlation_id = Some("corr-dl".to_string());
        parent.order.partner_code = Some("SQUIRE".to_string());
        parent.order.order_id = Some("ABC123".to_string());
        parent.derive_command()
    }

    #[tokio::test]
    async fn reported_message_is_completed_and_announced() {
        let fixture = fixture();
        let delivery =
            StubDelivery::for_message("submit-order/$DeadLetterQueue", &dead_lettered());

        let disposition = fixture.handler.handle(&delivery).await.unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(delivery.completions(), 1);
        let call = &fixture.domain.dead_letter_notification.calls()[0];
        assert_eq!(call.location.as_deref(), Some("submit-order/$DeadLetterQueue"));
        assert_eq!(call.order_id, "ABC123");
        assert_eq!(call.correlation_id.as_deref(), Some("corr-dl"));

        let events = fixture.events.messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_type(), "NotificationSent");
    }

    #[tokio::test]
    async fn failure_result_is_not_retried() {
        let fixture = fixture();
        fixture
            .domain
            .dead_letter_notification
            .always(Ok(OperationResult::retriable_failure("mail server busy")));
        let delivery =
            StubDelivery::for_message("submit-order/$DeadLetterQueue", &dead_lettered());

        let error = fixture.handler.handle(&delivery).await.unwrap_err();

        assert!(error.is_escalation());
        assert_eq!(delivery.completions(), 0);
        assert!(fixture.events.messages().is_empty());
    }

    #[tokio::test]
    async fn notifier_error_announces_failure() {
        let fixture = fixture();
        fixture
            .domain
            .dead_letter_notification
            .always(Err(OperationError::DependencyUnavailable("smtp".to_string())));
        let delivery =
            StubDelivery::for_message("process-order/$DeadLetterQueue", &dead_lettered());

        let error = fixture.handler.handle(&delivery).await.unwrap_err();

        assert!(matches!(error, HandlerError::Operation(_)));
        let events = fixture.events.messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_type(), "NotificationFailed");
        assert_eq!(events[0].correlation_id(), Some("corr-dl"));
    }

    #[tokio::test]
    async fn unreadable_body_synthesizes_failure_event() {
        let fixture = fixture();
        let delivery = StubDelivery::new("process-order/$DeadLetterQueue", Some(b"not json".to_vec()))
            .with_correlation_id(Some("envelope-corr"));

        let error = fixture.handler.handle(&delivery).await.unwrap_err();

        assert!(matches!(error, HandlerError::Malformed { .. }));
        assert_eq!(fixture.domain.dead_letter_notification.call_count(), 0);
        let events = fixture.events.messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id(), Some("envelope-corr"));
        assert_eq!(events[0].header().occurred_time_utc, test_clock().now());
    }

    #[tokio::test]
    async fn foreign_object_is_not_reported() {
        let fixture = fixture();
        let delivery = StubDelivery::new(
            "process-order/$DeadLetterQueue",
            Some(br#"{"unrelated":true}"#.to_vec()),
        )
        .with_correlation_id(Some("envelope-corr"));

        let error = fixture.handler.handle(&delivery).await.unwrap_err();

        assert!(matches!(error, HandlerError::MissingDependency { .. }));
        assert_eq!(delivery.completions(), 0);
        assert_eq!(fixture.domain.dead_letter_notification.call_count(), 0);
        let events = fixture.events.messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_type(), "NotificationFailed");
        assert_eq!(events[0].correlation_id(), Some("envelope-corr"));
    }
}
