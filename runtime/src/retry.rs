//! Scheduling retries of failed commands with exponential backoff.
//!
//! A retry is not a loop inside the handler. The failed command is published
//! again to its own channel with an incremented attempt count, deferred until
//! the backoff has elapsed, and the current delivery is acknowledged.
//!
//! ```text
//! delay = 2^attempts × exponential_base_seconds + U[0, 1) × jitter_base_seconds
//! ```
//!
//! `attempts` is the count *after* incrementing, so the first retry waits at
//! least `2 × exponential_base_seconds`.
//!
//! # Example
//!
//! ```rust
//! use order_fulfillment_runtime::retry::CommandRetryThresholds;
//!
//! let thresholds = CommandRetryThresholds::builder()
//!     .max_count(3)
//!     .exponential_base_seconds(1.5)
//!     .jitter_base_seconds(0.5)
//!     .build();
//!
//! let delay = thresholds.delay_seconds(2, 0.0);
//! assert!((delay - 6.0).abs() < f64::EPSILON);
//! ```

use crate::metrics::PipelineMetrics;
use chrono::{DateTime, TimeDelta, Utc};
use order_fulfillment_core::environment::Clock;
use order_fulfillment_core::message::Command;
use order_fulfillment_core::publisher::{PublishError, Publisher};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Retry budget and backoff parameters for commands.
///
/// # Default Values
///
/// - `max_count`: 5
/// - `exponential_base_seconds`: 2.0
/// - `jitter_base_seconds`: 3.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandRetryThresholds {
    /// Attempts after which a command is given up on.
    pub max_count: u32,
    /// Base of the exponential part of the delay, in seconds.
    pub exponential_base_seconds: f64,
    /// Upper bound of the random part of the delay, in seconds.
    pub jitter_base_seconds: f64,
}

impl Default for CommandRetryThresholds {
    fn default() -> Self {
        Self::new(5, 2.0, 3.0)
    }
}

impl CommandRetryThresholds {
    /// Create thresholds from explicit values.
    #[must_use]
    pub const fn new(max_count: u32, exponential_base_seconds: f64, jitter_base_seconds: f64) -> Self {
        Self {
            max_count,
            exponential_base_seconds,
            jitter_base_seconds,
        }
    }

    /// Create a new thresholds builder.
    #[must_use]
    pub const fn builder() -> CommandRetryThresholdsBuilder {
        CommandRetryThresholdsBuilder {
            max_count: 5,
            exponential_base_seconds: 2.0,
            jitter_base_seconds: 3.0,
        }
    }

    /// Whether a command that was already attempted `previous_attempts` times
    /// may be attempted again.
    #[must_use]
    pub const fn allows_another_attempt(&self, previous_attempts: u32) -> bool {
        previous_attempts < self.max_count
    }

    /// Backoff delay in seconds for the retry numbered `attempts`.
    ///
    /// `jitter_sample` is clamped to `[0, 1]`. The result always lies in
    /// `[2^attempts × base, 2^attempts × base + jitter]`.
    #[must_use]
    pub fn delay_seconds(&self, attempts: u32, jitter_sample: f64) -> f64 {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let sample = if jitter_sample.is_nan() {
            0.0
        } else {
            jitter_sample.clamp(0.0, 1.0)
        };

        2f64.powi(exponent) * self.exponential_base_seconds + sample * self.jitter_base_seconds
    }
}

/// Builder for [`CommandRetryThresholds`].
#[derive(Debug, Clone, Copy)]
pub struct CommandRetryThresholdsBuilder {
    max_count: u32,
    exponential_base_seconds: f64,
    jitter_base_seconds: f64,
}

impl CommandRetryThresholdsBuilder {
    /// Set the maximum number of attempts.
    #[must_use]
    pub const fn max_count(mut self, max_count: u32) -> Self {
        self.max_count = max_count;
        self
    }

    /// Set the exponential base in seconds.
    #[must_use]
    pub const fn exponential_base_seconds(mut self, seconds: f64) -> Self {
        self.exponential_base_seconds = seconds;
        self
    }

    /// Set the jitter base in seconds.
    #[must_use]
    pub const fn jitter_base_seconds(mut self, seconds: f64) -> Self {
        self.jitter_base_seconds = seconds;
        self
    }

    /// Build the [`CommandRetryThresholds`].
    #[must_use]
    pub const fn build(self) -> CommandRetryThresholds {
        CommandRetryThresholds::new(
            self.max_count,
            self.exponential_base_seconds,
            self.jitter_base_seconds,
        )
    }
}

/// Republishes failed commands with backoff while their budget lasts.
///
/// One scheduler is shared by every handler in a process. Its random
/// generator is seeded once and guarded by a mutex that is held only while
/// drawing a sample, never across an `.await`.
pub struct RetryScheduler {
    thresholds: CommandRetryThresholds,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl RetryScheduler {
    /// Create a scheduler with an entropy-seeded generator.
    #[must_use]
    pub fn new(thresholds: CommandRetryThresholds, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(thresholds, clock, StdRng::from_entropy())
    }

    /// Create a scheduler whose jitter sequence is reproducible.
    #[must_use]
    pub fn with_seed(thresholds: CommandRetryThresholds, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(thresholds, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(thresholds: CommandRetryThresholds, clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        Self {
            thresholds,
            clock,
            rng: Mutex::new(rng),
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub const fn thresholds(&self) -> &CommandRetryThresholds {
        &self.thresholds
    }

    /// Schedule another attempt of `command` if its budget allows.
    ///
    /// Returns `Ok(false)` without touching `command` or publishing when the
    /// budget is spent. Otherwise increments the attempt count in place,
    /// publishes the command deferred by the backoff delay and returns
    /// `Ok(true)`.
    ///
    /// Call at most once per failed handling attempt.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the retry could not be published. The
    /// attempt count has already been incremented at that point.
    pub async fn schedule_retry_if_eligible<C: Command>(
        &self,
        command: &mut C,
        publisher: &dyn Publisher<C>,
    ) -> Result<bool, PublishError> {
        if !self.thresholds.allows_another_attempt(command.previous_attempts()) {
            return Ok(false);
        }

        let header = command.command_header_mut();
        header.previous_attempts_to_handle_count += 1;
        let attempts = header.previous_attempts_to_handle_count;

        let delay_seconds = self.thresholds.delay_seconds(attempts, self.sample_jitter());
        let retry_at = retry_instant(self.clock.now(), delay_seconds);

        publisher.publish(command, Some(retry_at)).await?;

        PipelineMetrics::record_retry(C::TYPE, delay_seconds);
        tracing::warn!(
            command_type = C::TYPE,
            message_id = %command.id(),
            attempt = attempts,
            max_count = self.thresholds.max_count,
            delay_seconds,
            retry_at = %retry_at,
            "Command scheduled for retry"
        );

        Ok(true)
    }

    fn sample_jitter(&self) -> f64 {
        // A poisoned lock still holds a usable generator.
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        rng.gen_range(0.0..1.0)
    }
}

/// `now` plus `delay_seconds`, saturating at the latest representable instant.
fn retry_instant(now: DateTime<Utc>, delay_seconds: f64) -> DateTime<Utc> {
    std::time::Duration::try_from_secs_f64(delay_seconds)
        .ok()
        .and_then(|delay| TimeDelta::from_std(delay).ok())
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use order_fulfillment_core::message::{ProcessOrder, SubmitOrderForProduction};
    use order_fulfillment_testing::{RecordingPublisher, test_clock};
    use proptest::prelude::*;

    fn scheduler(max_count: u32) -> RetryScheduler {
        RetryScheduler::with_seed(
            CommandRetryThresholds::new(max_count, 2.0, 3.0),
            Arc::new(test_clock()),
            7,
        )
    }

    fn command(previous_attempts: u32) -> SubmitOrderForProduction {
        let mut command = SubmitOrderForProduction::default();
        command.command.previous_attempts_to_handle_count = previous_attempts;
        command.order.order_id = Some("ABC123".to_string());
        command
    }

    #[test]
    fn delay_for_first_retry() {
        let thresholds = CommandRetryThresholds::new(5, 2.0, 3.0);
        assert!((thresholds.delay_seconds(1, 0.0) - 4.0).abs() < f64::EPSILON);
        assert!((thresholds.delay_seconds(1, 1.0) - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn huge_delays_saturate() {
        let now = test_clock().now();
        assert_eq!(retry_instant(now, f64::INFINITY), DateTime::<Utc>::MAX_UTC);
        assert_eq!(retry_instant(now, 0.0), now);
    }

    #[tokio::test]
    async fn schedules_when_budget_remains() {
        let scheduler = scheduler(3);
        let publisher = RecordingPublisher::<SubmitOrderForProduction>::new();
        let mut command = command(2);

        let scheduled = scheduler
            .schedule_retry_if_eligible(&mut command, &publisher)
            .await
            .unwrap();

        assert!(scheduled);
        assert_eq!(command.previous_attempts(), 3);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message.previous_attempts(), 3);

        // 2^3 × 2 = 16 seconds, plus up to 3 seconds of jitter.
        let now = test_clock().now();
        let retry_at = published[0].defer_until.unwrap();
        assert!(retry_at >= now + TimeDelta::seconds(16));
        assert!(retry_at <= now + TimeDelta::seconds(19));
    }

    #[tokio::test]
    async fn refuses_when_budget_is_spent() {
        let scheduler = scheduler(3);
        let publisher = RecordingPublisher::<SubmitOrderForProduction>::new();

        for previous in [3, 4, 10] {
            let mut command = command(previous);
            let before = command.clone();

            let scheduled = scheduler
                .schedule_retry_if_eligible(&mut command, &publisher)
                .await
                .unwrap();

            assert!(!scheduled);
            assert_eq!(command, before);
        }
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn zero_budget_never_retries() {
        let scheduler = scheduler(0);
        let publisher = RecordingPublisher::<ProcessOrder>::new();
        let mut command = ProcessOrder::default();

        assert!(
            !scheduler
                .schedule_retry_if_eligible(&mut command, &publisher)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let scheduler = scheduler(3);
        let publisher = RecordingPublisher::<SubmitOrderForProduction>::failing();
        let mut command = command(0);

        let result = scheduler
            .schedule_retry_if_eligible(&mut command, &publisher)
            .await;

        assert!(result.is_err());
        assert_eq!(command.previous_attempts(), 1);
    }

    #[tokio::test]
    async fn concurrent_scheduling_shares_generator_safely() {
        let scheduler = Arc::new(scheduler(100));
        let publisher = Arc::new(RecordingPublisher::<SubmitOrderForProduction>::new());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                let publisher = Arc::clone(&publisher);
                tokio::spawn(async move {
                    let mut command = command(0);
                    scheduler
                        .schedule_retry_if_eligible(&mut command, publisher.as_ref())
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(publisher.published().len(), 16);
    }

    proptest! {
        #[test]
        fn delay_stays_within_bounds(
            attempts in 1u32..20,
            base in 0.0f64..60.0,
            jitter in 0.0f64..60.0,
            sample in 0.0f64..1.0,
        ) {
            let thresholds = CommandRetryThresholds::new(20, base, jitter);
            let delay = thresholds.delay_seconds(attempts, sample);
            let floor = 2f64.powi(i32::try_from(attempts).unwrap()) * base;

            prop_assert!(delay >= floor);
            prop_assert!(delay <= floor + jitter);
        }

        #[test]
        fn each_scheduled_retry_increments_once(initial in 0u32..5, calls in 0usize..10) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let max_count = 8;
            let scheduler = scheduler(max_count);
            let publisher = RecordingPublisher::<SubmitOrderForProduction>::new();
            let mut command = command(initial);

            let mut scheduled = 0;
            for _ in 0..calls {
                let before = command.previous_attempts();
                let accepted = runtime
                    .block_on(scheduler.schedule_retry_if_eligible(&mut command, &publisher))
                    .unwrap();
                if accepted {
                    scheduled += 1;
                    prop_assert_eq!(command.previous_attempts(), before + 1);
                } else {
                    prop_assert_eq!(command.previous_attempts(), before);
                    prop_assert!(before >= max_count);
                }
            }

            prop_assert_eq!(command.previous_attempts(), initial + scheduled);
            prop_assert_eq!(publisher.published().len() as u32, scheduled);
        }
    }
}
