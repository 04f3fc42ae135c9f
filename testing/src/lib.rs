//! # Order Fulfillment Testing
//!
//! Test doubles for the order fulfillment pipeline.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A publisher that records what it was asked to send ([`RecordingPublisher`])
//! - An in-memory broker with deferred visibility and dead-lettering ([`InMemoryBroker`])
//! - A hand-built delivery for driving a single handler call ([`StubDelivery`])
//! - Scripted domain collaborators ([`ScriptedDomain`])
//!
//! ## Example
//!
//! ```ignore
//! use order_fulfillment_testing::{InMemoryBroker, ManualClock, test_clock};
//!
//! let clock = Arc::new(ManualClock::new(test_clock().now()));
//! let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));
//!
//! // ... publish a retry deferred by 16 seconds ...
//! assert!(broker.receive("submit-order").is_none());
//! clock.advance(chrono::TimeDelta::seconds(16));
//! assert!(broker.receive("submit-order").is_some());
//! ```

use chrono::{DateTime, Utc};
use order_fulfillment_core::environment::Clock;

pub mod broker;
pub mod domain;
pub mod publishers;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_fulfillment_testing::mocks::FixedClock;
    /// use order_fulfillment_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to step past deferred-delivery instants.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward by `delta`.
        pub fn advance(&self, delta: chrono::TimeDelta) {
            let mut time = self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += delta;
        }

        /// Set the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryDelivery, StubDelivery};
pub use domain::{RecordedCall, ScriptedDomain, ScriptedResponses};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use publishers::{Published, RecordingPublisher};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_advances() {
        let start = test_clock().now();
        let clock = ManualClock::new(start);

        clock.advance(chrono::TimeDelta::seconds(90));
        assert_eq!(clock.now(), start + chrono::TimeDelta::seconds(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
