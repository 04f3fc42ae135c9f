//! Runs the fulfillment workers against an in-memory broker.
//!
//! One order is published. Processing succeeds, submission fails twice (once
//! with a retriable result, once with an error) and then succeeds on the
//! second retry. The events published along the way are printed as JSON.
//!
//! Run with: `cargo run -p order-fulfillment-runtime --example fulfillment_demo`

use anyhow::Context;
use futures::StreamExt;
use order_fulfillment_core::domain::OperationError;
use order_fulfillment_core::environment::{Clock, SystemClock};
use order_fulfillment_core::message::{FulfillmentEvent, Message, ProcessOrder};
use order_fulfillment_core::operation::OperationResult;
use order_fulfillment_core::transport::Transport;
use order_fulfillment_runtime::metrics::MetricsServer;
use order_fulfillment_runtime::{
    CommandRetryThresholds, Dispatcher, DomainServices, FulfillmentConfig, FulfillmentWorkers,
    InMemoryDeliveryLedger, standard_environment,
};
use order_fulfillment_testing::{InMemoryBroker, ScriptedDomain};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const RUN_FOR: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut metrics = MetricsServer::new("127.0.0.1:9090".parse()?);
    metrics.start()?;

    let mut config = FulfillmentConfig::from_env()?;
    config.retry = CommandRetryThresholds::builder()
        .max_count(2)
        .exponential_base_seconds(0.05)
        .jitter_base_seconds(0.05)
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let transport: Arc<dyn Transport> = broker.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let environment = standard_environment(
        &config,
        &transport,
        clock,
        Some(Arc::new(InMemoryDeliveryLedger::default())),
    )?;

    let domain = Arc::new(ScriptedDomain::new());
    domain.submission.push(Ok(OperationResult::retriable_failure(
        "The production system is busy.",
    )));
    domain.submission.push(Err(OperationError::DependencyUnavailable(
        "production api".to_string(),
    )));
    let services = DomainServices::from_single(domain.clone());
    let workers = FulfillmentWorkers::build(&environment, &services, &config.channels)?;

    let mut order = ProcessOrder::default();
    order.header_mut().id = Uuid::new_v4();
    order.header_mut().correlation_id = Some("demo-order-1".to_string());
    order.order.partner_code = Some("SQUIRE".to_string());
    order.order.order_id = Some("ABC123".to_string());
    environment
        .registry
        .publisher::<ProcessOrder>()?
        .publish(&order, None)
        .await?;

    let mut running = JoinSet::new();
    for channel in workers.channels() {
        let handler = workers
            .handler_for(channel)
            .with_context(|| format!("no handler bound to {channel}"))?;
        let deliveries = broker
            .subscribe(channel, POLL_INTERVAL)
            .take_until(tokio::time::sleep(RUN_FOR));
        let dispatcher = Dispatcher::new(config.max_concurrency);
        let channel = channel.to_string();
        running.spawn(async move { (channel, dispatcher.run(deliveries, handler).await) });
    }

    while let Some(finished) = running.join_next().await {
        let (channel, summary) = finished?;
        tracing::info!(channel, ?summary, "Worker stopped");
    }

    println!("submission attempts: {}", domain.submission.call_count());
    for event in broker.pending_messages::<FulfillmentEvent>(&config.channels.events) {
        println!("{}: {}", event.message_type(), serde_json::to_string(&event)?);
    }
    if let Some(text) = metrics.render() {
        println!("{text}");
    }

    Ok(())
}
