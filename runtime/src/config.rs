//! Worker configuration.
//!
//! Everything has a default; environment variables override individual values.
//!
//! | Variable | Default |
//! |---|---|
//! | `FULFILLMENT_RETRY_MAX_COUNT` | `5` |
//! | `FULFILLMENT_RETRY_EXPONENTIAL_SECONDS` | `2.0` |
//! | `FULFILLMENT_RETRY_JITTER_SECONDS` | `3.0` |
//! | `FULFILLMENT_BROKERS` | `localhost:9092` |
//! | `FULFILLMENT_PROCESS_ORDER_CHANNEL` | `process-order` |
//! | `FULFILLMENT_SUBMIT_ORDER_CHANNEL` | `submit-order` |
//! | `FULFILLMENT_NOTIFY_FAILURE_CHANNEL` | `notify-fulfillment-failure` |
//! | `FULFILLMENT_EVENT_CHANNEL` | `fulfillment-events` |
//! | `FULFILLMENT_MAX_CONCURRENCY` | `16` |
//!
//! # Example
//!
//! ```no_run
//! use order_fulfillment_runtime::config::FulfillmentConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FulfillmentConfig::from_env()?;
//! println!("Retrying up to {} times", config.retry.max_count);
//! # Ok(())
//! # }
//! ```

use crate::dispatcher::DEFAULT_MAX_CONCURRENCY;
use crate::retry::CommandRetryThresholds;
use order_fulfillment_core::channels::ChannelNames;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable names.
pub mod keys {
    /// Retry budget.
    pub const RETRY_MAX_COUNT: &str = "FULFILLMENT_RETRY_MAX_COUNT";
    /// Exponential backoff base, in seconds.
    pub const RETRY_EXPONENTIAL_SECONDS: &str = "FULFILLMENT_RETRY_EXPONENTIAL_SECONDS";
    /// Jitter base, in seconds.
    pub const RETRY_JITTER_SECONDS: &str = "FULFILLMENT_RETRY_JITTER_SECONDS";
    /// Broker bootstrap address.
    pub const BROKERS: &str = "FULFILLMENT_BROKERS";
    /// Process-order channel name.
    pub const PROCESS_ORDER_CHANNEL: &str = "FULFILLMENT_PROCESS_ORDER_CHANNEL";
    /// Submit-order channel name.
    pub const SUBMIT_ORDER_CHANNEL: &str = "FULFILLMENT_SUBMIT_ORDER_CHANNEL";
    /// Failure notification channel name.
    pub const NOTIFY_FAILURE_CHANNEL: &str = "FULFILLMENT_NOTIFY_FAILURE_CHANNEL";
    /// Event channel name.
    pub const EVENT_CHANNEL: &str = "FULFILLMENT_EVENT_CHANNEL";
    /// Dispatcher concurrency bound.
    pub const MAX_CONCURRENCY: &str = "FULFILLMENT_MAX_CONCURRENCY";
}

/// Default broker bootstrap address.
pub const DEFAULT_BROKERS: &str = "localhost:9092";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value could not be used.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration of a fulfillment worker process.
#[derive(Clone, Debug, PartialEq)]
pub struct FulfillmentConfig {
    /// Retry thresholds shared by every pipeline.
    pub retry: CommandRetryThresholds,
    /// Channel names.
    pub channels: ChannelNames,
    /// Broker bootstrap address.
    pub brokers: String,
    /// Deliveries handled at once per channel.
    pub max_concurrency: usize,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            retry: CommandRetryThresholds::default(),
            channels: ChannelNames::default(),
            brokers: DEFAULT_BROKERS.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl FulfillmentConfig {
    /// Load from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set to an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a value is unusable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max_count) = parse(&lookup, keys::RETRY_MAX_COUNT)? {
            config.retry.max_count = max_count;
        }
        if let Some(seconds) = parse(&lookup, keys::RETRY_EXPONENTIAL_SECONDS)? {
            config.retry.exponential_base_seconds = seconds;
        }
        if let Some(seconds) = parse(&lookup, keys::RETRY_JITTER_SECONDS)? {
            config.retry.jitter_base_seconds = seconds;
        }
        if let Some(max_concurrency) = parse(&lookup, keys::MAX_CONCURRENCY)? {
            config.max_concurrency = max_concurrency;
        }

        let text = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        if let Some(brokers) = text(keys::BROKERS) {
            config.brokers = brokers;
        }
        if let Some(channel) = text(keys::PROCESS_ORDER_CHANNEL) {
            config.channels.process_order = channel;
        }
        if let Some(channel) = text(keys::SUBMIT_ORDER_CHANNEL) {
            config.channels.submit_order = channel;
        }
        if let Some(channel) = text(keys::NOTIFY_FAILURE_CHANNEL) {
            config.channels.notify_fatal_failure = channel;
        }
        if let Some(channel) = text(keys::EVENT_CHANNEL) {
            config.channels.events = channel;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let seconds = [
            (keys::RETRY_EXPONENTIAL_SECONDS, self.retry.exponential_base_seconds),
            (keys::RETRY_JITTER_SECONDS, self.retry.jitter_base_seconds),
        ];
        for (key, value) in seconds {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(
                    key,
                    value,
                    "must be a finite, non-negative number of seconds",
                ));
            }
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                keys::MAX_CONCURRENCY,
                self.max_concurrency,
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed
        .parse()
        .map(Some)
        .map_err(|error: T::Err| ConfigError::invalid(key, trimmed, error.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = FulfillmentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FulfillmentConfig::default());
        assert_eq!(config.retry.max_count, 5);
        assert_eq!(config.channels.events, "fulfillment-events");
    }

    #[test]
    fn variables_override_defaults() {
        let config = FulfillmentConfig::from_lookup(lookup(&[
            (keys::RETRY_MAX_COUNT, "3"),
            (keys::RETRY_EXPONENTIAL_SECONDS, "0.5"),
            (keys::RETRY_JITTER_SECONDS, " 0 "),
            (keys::BROKERS, "redpanda:9092"),
            (keys::SUBMIT_ORDER_CHANNEL, "submit-order-v2"),
            (keys::MAX_CONCURRENCY, "4"),
        ]))
        .unwrap();

        assert_eq!(config.retry, CommandRetryThresholds::new(3, 0.5, 0.0));
        assert_eq!(config.brokers, "redpanda:9092");
        assert_eq!(config.channels.submit_order, "submit-order-v2");
        assert_eq!(config.channels.process_order, "process-order");
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let error =
            FulfillmentConfig::from_lookup(lookup(&[(keys::RETRY_MAX_COUNT, "many")])).unwrap_err();

        let ConfigError::Invalid { key, value, .. } = error;
        assert_eq!(key, keys::RETRY_MAX_COUNT);
        assert_eq!(value, "many");
    }

    #[test]
    fn negative_or_infinite_delays_are_rejected() {
        assert!(
            FulfillmentConfig::from_lookup(lookup(&[(keys::RETRY_JITTER_SECONDS, "-1")])).is_err()
        );
        assert!(
            FulfillmentConfig::from_lookup(lookup(&[(keys::RETRY_EXPONENTIAL_SECONDS, "inf")]))
                .is_err()
        );
        assert!(FulfillmentConfig::from_lookup(lookup(&[(keys::MAX_CONCURRENCY, "0")])).is_err());
    }
}
