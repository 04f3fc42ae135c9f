//! Record of successfully handled deliveries.
//!
//! Delivery is at-least-once, so a command can arrive again after it was
//! handled (a lost acknowledgement, a producer that published twice). A
//! [`DeliveryLedger`] lets a pipeline recognise such repeats and complete them
//! without invoking the domain operation a second time.
//!
//! Entries are keyed by message id *and* attempt count: a scheduled retry
//! keeps the id of the command it retries, and must not be mistaken for a
//! repeat of the attempt that failed.

use order_fulfillment_core::message::Command;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Identity of one handling attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    /// Id of the command.
    pub message_id: Uuid,
    /// Attempt count carried by the command.
    pub previous_attempts: u32,
}

impl DeliveryKey {
    /// Key of `command`, or `None` if it has no id to key on.
    #[must_use]
    pub fn of<C: Command>(command: &C) -> Option<Self> {
        let message_id = command.id();
        (!message_id.is_nil()).then(|| Self {
            message_id,
            previous_attempts: command.previous_attempts(),
        })
    }
}

/// Remembers which attempts completed successfully.
pub trait DeliveryLedger: Send + Sync {
    /// Whether `key` already completed.
    fn is_completed(&self, key: &DeliveryKey) -> bool;

    /// Remember that `key` completed.
    fn record_completed(&self, key: DeliveryKey);
}

/// Bounded in-process ledger.
///
/// Holds the most recent `capacity` keys and forgets the oldest first.
pub struct InMemoryDeliveryLedger {
    capacity: usize,
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    keys: HashSet<DeliveryKey>,
    order: VecDeque<DeliveryKey>,
}

impl InMemoryDeliveryLedger {
    /// Default number of remembered keys.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Create a ledger remembering up to `capacity` keys.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryDeliveryLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl DeliveryLedger for InMemoryDeliveryLedger {
    fn is_completed(&self, key: &DeliveryKey) -> bool {
        self.lock().keys.contains(key)
    }

    fn record_completed(&self, key: DeliveryKey) {
        let mut entries = self.lock();
        if !entries.keys.insert(key) {
            return;
        }
        entries.order.push_back(key);

        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.keys.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_fulfillment_core::message::ProcessOrder;

    fn key(attempts: u32) -> DeliveryKey {
        DeliveryKey {
            message_id: Uuid::from_u128(7),
            previous_attempts: attempts,
        }
    }

    #[test]
    fn nil_ids_are_not_keyed() {
        assert_eq!(DeliveryKey::of(&ProcessOrder::default()), None);
    }

    #[test]
    fn retries_are_distinct_from_the_failed_attempt() {
        let ledger = InMemoryDeliveryLedger::default();
        ledger.record_completed(key(1));

        assert!(ledger.is_completed(&key(1)));
        assert!(!ledger.is_completed(&key(2)));
    }

    #[test]
    fn oldest_keys_are_forgotten_first() {
        let ledger = InMemoryDeliveryLedger::new(2);
        ledger.record_completed(key(0));
        ledger.record_completed(key(1));
        ledger.record_completed(key(1));
        ledger.record_completed(key(2));

        assert_eq!(ledger.len(), 2);
        assert!(!ledger.is_completed(&key(0)));
        assert!(ledger.is_completed(&key(2)));
    }
}
