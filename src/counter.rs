//! Lock-serialized signed counter.
//!
//! Tracks how many workers are in the middle of a batch. Reads go through the
//! same lock as writes, so a read never observes a partially applied update.

use std::sync::{Mutex, PoisonError};

/// Thread-safe accumulator.
#[derive(Debug, Default)]
pub struct Counter {
    value: Mutex<i64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` and return the new value.
    pub fn increase_by(&self, delta: i64) -> i64 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value += delta;
        *value
    }

    /// Current value, serialized like any mutation.
    pub fn value(&self) -> i64 {
        self.increase_by(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_at_zero() {
        assert_eq!(Counter::new().value(), 0);
    }

    #[test]
    fn increase_returns_new_value() {
        let counter = Counter::new();
        assert_eq!(counter.increase_by(3), 3);
        assert_eq!(counter.increase_by(-5), -2);
        assert_eq!(counter.value(), -2);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let counter = Arc::new(Counter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increase_by(1);
                        counter.increase_by(-1);
                        counter.increase_by(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.value(), 8000);
    }
}
