//! Publisher double that records every publish call.

#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use order_fulfillment_core::message::Message;
use order_fulfillment_core::publisher::{PublishError, Publisher};
use order_fulfillment_core::transport::TransportError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// One recorded publish call.
#[derive(Clone, Debug, PartialEq)]
pub struct Published<M> {
    /// The message as it was at publish time.
    pub message: M,
    /// Requested visibility instant.
    pub defer_until: Option<DateTime<Utc>>,
}

/// Records published messages instead of sending them.
///
/// Can be switched into a failing mode, in which every publish returns a
/// transport error and nothing is recorded.
///
/// # Example
///
/// ```
/// use order_fulfillment_core::message::ProcessOrder;
/// use order_fulfillment_core::publisher::Publisher;
/// use order_fulfillment_testing::RecordingPublisher;
///
/// # block_on(async {
/// let publisher = RecordingPublisher::<ProcessOrder>::new();
/// publisher.publish(&ProcessOrder::default(), None).await.unwrap();
/// assert_eq!(publisher.published().len(), 1);
/// # });
/// # fn block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct RecordingPublisher<M> {
    published: Mutex<Vec<Published<M>>>,
    failing: AtomicBool,
}

impl<M: Message> RecordingPublisher<M> {
    /// A publisher that accepts everything.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// A publisher that rejects everything.
    #[must_use]
    pub const fn failing() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
        }
    }

    /// Switch failing mode on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything published so far, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<Published<M>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Published messages without their defer instants.
    #[must_use]
    pub fn messages(&self) -> Vec<M> {
        self.published()
            .into_iter()
            .map(|published| published.message)
            .collect()
    }
}

impl<M: Message> Default for RecordingPublisher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Message> Publisher<M> for RecordingPublisher<M> {
    fn publish<'a>(
        &'a self,
        message: &'a M,
        defer_until: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::Transport(TransportError::ChannelUnavailable {
                    channel: M::TYPE.to_string(),
                    reason: "recording publisher is set to fail".to_string(),
                }));
            }

            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Published {
                    message: message.clone(),
                    defer_until,
                });
            Ok(())
        })
    }
}
