//! Assembly of the fulfillment workers.
//!
//! [`FulfillmentWorkers`] binds every channel a worker process consumes to the
//! handler for it:
//!
//! | Channel | Handler |
//! |---|---|
//! | process-order | `CommandPipeline<ProcessOrderWorkflow>` |
//! | submit-order | `CommandPipeline<SubmitOrderWorkflow>` |
//! | notify-fulfillment-failure | `CommandPipeline<NotifyFailureWorkflow>` |
//! | each of the above + `/$DeadLetterQueue` | `DeadLetterHandler` |

use crate::config::FulfillmentConfig;
use crate::dead_letter::DeadLetterHandler;
use crate::ledger::DeliveryLedger;
use crate::pipeline::{CommandPipeline, DeliveryHandler, PipelineEnvironment};
use crate::registry::{PublisherRegistry, RegistryError};
use crate::retry::RetryScheduler;
use crate::workflows::{NotifyFailureWorkflow, ProcessOrderWorkflow, SubmitOrderWorkflow};
use order_fulfillment_core::channels::{self, ChannelNames};
use order_fulfillment_core::domain::{Notifier, OrderProcessor, OrderSubmitter};
use order_fulfillment_core::environment::Clock;
use order_fulfillment_core::transport::Transport;
use std::sync::Arc;

/// Domain collaborators the workers call into.
#[derive(Clone)]
pub struct DomainServices {
    /// Order processing.
    pub processor: Arc<dyn OrderProcessor>,
    /// Production submission.
    pub submitter: Arc<dyn OrderSubmitter>,
    /// Operator notification.
    pub notifier: Arc<dyn Notifier>,
}

impl DomainServices {
    /// Use one value for every collaborator.
    pub fn from_single<T>(services: Arc<T>) -> Self
    where
        T: OrderProcessor + OrderSubmitter + Notifier + 'static,
    {
        Self {
            processor: services.clone(),
            submitter: services.clone(),
            notifier: services,
        }
    }
}

/// Build the shared pipeline environment for `config` on `transport`.
///
/// # Errors
///
/// Returns [`RegistryError`] if the standard publisher table cannot be built.
pub fn standard_environment(
    config: &FulfillmentConfig,
    transport: &Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
) -> Result<PipelineEnvironment, RegistryError> {
    Ok(PipelineEnvironment {
        scheduler: Arc::new(RetryScheduler::new(config.retry, Arc::clone(&clock))),
        registry: Arc::new(PublisherRegistry::standard(transport, &config.channels)?),
        clock,
        ledger,
    })
}

/// Handlers for every consumed channel.
pub struct FulfillmentWorkers {
    bindings: Vec<(String, Arc<dyn DeliveryHandler>)>,
}

impl FulfillmentWorkers {
    /// Build the handlers for `channels`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if the environment's registry
    /// lacks a publisher a handler needs.
    pub fn build(
        environment: &PipelineEnvironment,
        services: &DomainServices,
        channels: &ChannelNames,
    ) -> Result<Self, RegistryError> {
        let process: Arc<dyn DeliveryHandler> = Arc::new(CommandPipeline::new(
            ProcessOrderWorkflow::new(Arc::clone(&services.processor), &environment.registry)?,
            environment,
        )?);
        let submit: Arc<dyn DeliveryHandler> = Arc::new(CommandPipeline::new(
            SubmitOrderWorkflow::new(Arc::clone(&services.submitter)),
            environment,
        )?);
        let notify: Arc<dyn DeliveryHandler> = Arc::new(CommandPipeline::new(
            NotifyFailureWorkflow::new(Arc::clone(&services.notifier)),
            environment,
        )?);
        let dead_letters: Arc<dyn DeliveryHandler> = Arc::new(DeadLetterHandler::new(
            Arc::clone(&services.notifier),
            &environment.registry,
            Arc::clone(&environment.clock),
        )?);

        let mut bindings = vec![
            (channels.process_order.clone(), process),
            (channels.submit_order.clone(), submit),
            (channels.notify_fatal_failure.clone(), notify),
        ];
        bindings.extend(
            channels
                .dead_letter_channels()
                .into_iter()
                .map(|channel| (channel, Arc::clone(&dead_letters))),
        );

        for (channel, _) in &bindings {
            tracing::debug!(channel, "Handler bound");
        }
        Ok(Self { bindings })
    }

    /// Handler for deliveries from `channel`.
    #[must_use]
    pub fn handler_for(&self, channel: &str) -> Option<Arc<dyn DeliveryHandler>> {
        self.bindings
            .iter()
            .find(|(bound, _)| bound == channel)
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Every consumed channel, command channels first.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(channel, _)| channel.as_str())
    }

    /// Consumed channels that are dead-letter channels.
    pub fn dead_letter_channels(&self) -> impl Iterator<Item = &str> {
        self.channels().filter(|channel| channels::is_dead_letter(channel))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use order_fulfillment_testing::{InMemoryBroker, ScriptedDomain, test_clock};

    fn workers() -> FulfillmentWorkers {
        let config = FulfillmentConfig::default();
        let transport: Arc<dyn Transport> = Arc::new(InMemoryBroker::new());
        let environment =
            standard_environment(&config, &transport, Arc::new(test_clock()), None).unwrap();
        let services = DomainServices::from_single(Arc::new(ScriptedDomain::new()));
        FulfillmentWorkers::build(&environment, &services, &config.channels).unwrap()
    }

    #[test]
    fn every_command_channel_and_its_dead_letters_are_bound() {
        let workers = workers();

        assert_eq!(workers.channels().count(), 6);
        assert_eq!(workers.dead_letter_channels().count(), 3);
        assert!(workers.handler_for("process-order").is_some());
        assert!(workers.handler_for("notify-fulfillment-failure/$DeadLetterQueue").is_some());
        assert!(workers.handler_for("fulfillment-events").is_none());
    }

    #[test]
    fn missing_publishers_fail_the_build() {
        let environment = PipelineEnvironment {
            clock: Arc::new(test_clock()),
            scheduler: Arc::new(RetryScheduler::new(
                Default::default(),
                Arc::new(test_clock()),
            )),
            registry: Arc::new(PublisherRegistry::new()),
            ledger: None,
        };
        let services = DomainServices::from_single(Arc::new(ScriptedDomain::new()));

        let error = FulfillmentWorkers::build(&environment, &services, &ChannelNames::default())
            .err()
            .unwrap();
        assert!(matches!(error, RegistryError::NotRegistered { .. }));
    }
}
