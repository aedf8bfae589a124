//! Observers receiving pool events

use super::messages::PoolMessage;
use parking_lot::Mutex;
use std::fmt::Debug;

/// Receives every message a pool emits
///
/// Called synchronously while the pool is being mutated, so
/// implementations should hand work off rather than block.
pub trait PoolObserver: Send + Sync + Debug {
    fn notify(&self, message: PoolMessage);
}

/// Observer that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {
    fn notify(&self, _message: PoolMessage) {}
}

/// Observer that records messages in memory
#[derive(Debug, Default)]
pub struct InMemoryObserver {
    messages: Mutex<Vec<PoolMessage>>,
}

impl InMemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn messages(&self) -> Vec<PoolMessage> {
        self.messages.lock().clone()
    }

    /// Drain recorded messages
    pub fn take(&self) -> Vec<PoolMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Messages for one pool
    pub fn for_pool(&self, pool: &str) -> Vec<PoolMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.pool() == pool)
            .cloned()
            .collect()
    }
}

impl PoolObserver for InMemoryObserver {
    fn notify(&self, message: PoolMessage) {
        self.messages.lock().push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_observer_records() {
        let observer = InMemoryObserver::new();
        observer.notify(PoolMessage::pool_removed("a"));
        observer.notify(PoolMessage::pool_removed("b"));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.for_pool("a").len(), 1);
        assert_eq!(observer.take().len(), 2);
        assert!(observer.is_empty());
    }
}
