//! The fulfillment command workflows.
//!
//! | Command | Operation | On success | Escalates |
//! |---|---|---|---|
//! | `ProcessOrder` | [`OrderProcessor::process_order`] | publishes `SubmitOrderForProduction`, `OrderProcessed` | yes |
//! | `SubmitOrderForProduction` | [`OrderSubmitter::submit_order_for_production`] | `OrderSubmitted` | yes |
//! | `NotifyOfFatalFailure` | [`Notifier::notify_of_order_failure`] | `NotificationSent` | no |
//!
//! Absent partner codes and order ids reach the operations as empty strings.

use crate::pipeline::CommandWorkflow;
use crate::registry::{PublisherRegistry, RegistryError};
use order_fulfillment_core::domain::{Notifier, OperationFuture, OrderProcessor, OrderSubmitter};
use order_fulfillment_core::message::{
    NotificationFailed, NotificationSent, NotifyOfFatalFailure, OrderProcessed,
    OrderProcessingFailed, OrderScoped, OrderSubmissionFailed, OrderSubmitted, ProcessOrder,
    SubmitOrderForProduction,
};
use order_fulfillment_core::publisher::{PublishError, Publisher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Processes received orders and hands them on for submission.
pub struct ProcessOrderWorkflow {
    processor: Arc<dyn OrderProcessor>,
    submissions: Arc<dyn Publisher<SubmitOrderForProduction>>,
}

impl ProcessOrderWorkflow {
    /// Create the workflow, taking the submission publisher from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if no `SubmitOrderForProduction`
    /// publisher is registered.
    pub fn new(
        processor: Arc<dyn OrderProcessor>,
        registry: &PublisherRegistry,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            processor,
            submissions: registry.publisher::<SubmitOrderForProduction>()?,
        })
    }
}

impl CommandWorkflow for ProcessOrderWorkflow {
    type Command = ProcessOrder;
    type SuccessEvent = OrderProcessed;
    type FailureEvent = OrderProcessingFailed;

    fn invoke<'a>(
        &'a self,
        command: &'a ProcessOrder,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let order = command.order();
        self.processor.process_order(
            order.partner_code.as_deref().unwrap_or_default(),
            order.order_id.as_deref().unwrap_or_default(),
            &command.assets,
            command.emulation.as_ref(),
            correlation_id,
        )
    }

    fn chain<'a>(
        &'a self,
        command: &'a ProcessOrder,
        _payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            let submit: SubmitOrderForProduction =
                command.derive_command_with(|submit: &mut SubmitOrderForProduction| {
                    submit.emulation.clone_from(&command.emulation);
                });
            self.submissions.publish(&submit, None).await
        })
    }
}

/// Submits processed orders for production.
pub struct SubmitOrderWorkflow {
    submitter: Arc<dyn OrderSubmitter>,
}

impl SubmitOrderWorkflow {
    /// Create the workflow.
    #[must_use]
    pub fn new(submitter: Arc<dyn OrderSubmitter>) -> Self {
        Self { submitter }
    }
}

impl CommandWorkflow for SubmitOrderWorkflow {
    type Command = SubmitOrderForProduction;
    type SuccessEvent = OrderSubmitted;
    type FailureEvent = OrderSubmissionFailed;

    fn invoke<'a>(
        &'a self,
        command: &'a SubmitOrderForProduction,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let order = command.order();
        self.submitter.submit_order_for_production(
            order.partner_code.as_deref().unwrap_or_default(),
            order.order_id.as_deref().unwrap_or_default(),
            command.emulation.as_ref(),
            correlation_id,
        )
    }
}

/// Tells operators about orders that failed permanently.
///
/// Never escalates: a failed notification must not produce another one.
pub struct NotifyFailureWorkflow {
    notifier: Arc<dyn Notifier>,
}

impl NotifyFailureWorkflow {
    /// Create the workflow.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl CommandWorkflow for NotifyFailureWorkflow {
    type Command = NotifyOfFatalFailure;
    type SuccessEvent = NotificationSent;
    type FailureEvent = NotificationFailed;

    fn invoke<'a>(
        &'a self,
        command: &'a NotifyOfFatalFailure,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let order = command.order();
        self.notifier.notify_of_order_failure(
            order.partner_code.as_deref().unwrap_or_default(),
            order.order_id.as_deref().unwrap_or_default(),
            correlation_id,
        )
    }

    fn escalates(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use order_fulfillment_core::message::{Command, Message};
    use order_fulfillment_core::operation::{DependencyEmulation, OperationResult};
    use order_fulfillment_testing::{RecordingPublisher, ScriptedDomain};

    fn process_order() -> ProcessOrder {
        let mut command = ProcessOrder::default();
        command.header_mut().correlation_id = Some("corr-9".to_string());
        command.order.partner_code = Some("SQUIRE".to_string());
        command.order.order_id = Some("ABC123".to_string());
        command
            .assets
            .insert("front".to_string(), "https://assets/front.png".to_string());
        command.emulation = Some(DependencyEmulation {
            order_submission: Some(OperationResult::success("emulated".to_string())),
            ..DependencyEmulation::default()
        });
        command
    }

    #[tokio::test]
    async fn process_order_passes_order_fields() {
        let domain = Arc::new(ScriptedDomain::new());
        let mut registry = PublisherRegistry::new();
        registry
            .register::<SubmitOrderForProduction>(Arc::new(
                RecordingPublisher::<SubmitOrderForProduction>::new(),
            ))
            .unwrap();
        let workflow = ProcessOrderWorkflow::new(domain.clone(), &registry).unwrap();

        workflow
            .invoke(&process_order(), Some("corr-9"))
            .await
            .unwrap();

        let call = &domain.processing.calls()[0];
        assert_eq!(call.partner_code, "SQUIRE");
        assert_eq!(call.order_id, "ABC123");
        assert_eq!(call.asset_count, 1);
        assert!(call.emulated);
    }

    #[tokio::test]
    async fn chained_submission_carries_emulation() {
        let submissions = Arc::new(RecordingPublisher::<SubmitOrderForProduction>::new());
        let mut registry = PublisherRegistry::new();
        registry
            .register::<SubmitOrderForProduction>(submissions.clone())
            .unwrap();
        let workflow = ProcessOrderWorkflow::new(Arc::new(ScriptedDomain::new()), &registry).unwrap();
        let command = process_order();

        workflow.chain(&command, "staged").await.unwrap();

        let published = submissions.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].defer_until, None);
        let submit = &published[0].message;
        assert_ne!(submit.id(), command.id());
        assert_eq!(submit.correlation_id(), Some("corr-9"));
        assert_eq!(submit.order, command.order);
        assert_eq!(submit.emulation, command.emulation);
        assert_eq!(submit.previous_attempts(), 0);
    }

    #[tokio::test]
    async fn missing_order_fields_become_empty_strings() {
        let domain = Arc::new(ScriptedDomain::new());
        let workflow = SubmitOrderWorkflow::new(domain.clone());

        workflow
            .invoke(&SubmitOrderForProduction::default(), None)
            .await
            .unwrap();

        let call = &domain.submission.calls()[0];
        assert_eq!(call.partner_code, "");
        assert_eq!(call.order_id, "");
    }

    #[test]
    fn notification_does_not_escalate() {
        let workflow = NotifyFailureWorkflow::new(Arc::new(ScriptedDomain::new()));
        assert!(!workflow.escalates());
        assert!(SubmitOrderWorkflow::new(Arc::new(ScriptedDomain::new())).escalates());
    }
}
