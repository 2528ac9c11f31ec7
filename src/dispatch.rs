use std::collections::VecDeque;

use tokio::sync::{Mutex, Semaphore};

/// Bounded producer-consumer FIFO decoupling connection acceptance from
/// processing.
///
/// A fixed number of slot permits and item permits account for free and
/// occupied positions; their sum always equals the capacity. `insert` suspends
/// while the queue is full, which is the system's sole backpressure mechanism:
/// a saturated queue throttles the acceptor itself.
pub struct DispatchQueue<T> {
    inner: Mutex<VecDeque<T>>,
    slots: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl<T> DispatchQueue<T> {
    /// Create a queue with the given fixed capacity (must be non-zero)
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "dispatch queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Append an item at the tail, suspending while no slot is free.
    ///
    /// Items are never dropped or reordered.
    pub async fn insert(&self, item: T) {
        // The semaphores are never closed, so acquire cannot fail. The permit
        // is held across the lock so that cancellation mid-wait returns the
        // slot instead of leaking it.
        let permit = self
            .slots
            .acquire()
            .await
            .expect("dispatch queue semaphore closed");

        self.inner.lock().await.push_back(item);
        permit.forget();
        self.items.add_permits(1);
    }

    /// Remove and return the item at the head, suspending while empty
    pub async fn remove(&self) -> T {
        let permit = self
            .items
            .acquire()
            .await
            .expect("dispatch queue semaphore closed");

        let item = {
            let mut queue = self.inner.lock().await;
            // An item permit guarantees a queued item.
            queue
                .pop_front()
                .expect("item permit held with empty queue")
        };
        permit.forget();
        self.slots.add_permits(1);
        item
    }

    /// Fixed capacity of the queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently queued
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the queue is currently empty
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
