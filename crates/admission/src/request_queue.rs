//! Bounded-concurrency admission gate.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use adpilot_core::{ensure_positive, ConfigResult};

/// Queue sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// How long the admission pipeline waits for a slot
    pub acquire_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            acquire_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("max_concurrent", self.max_concurrent as u64)
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub max_concurrent: usize,
    pub currently_processing: usize,
    pub waiting_in_queue: usize,
    pub available_slots: usize,
}

#[derive(Debug, Default)]
struct Counts {
    processing: usize,
    waiting: usize,
}

/// Counting semaphore with a bounded wait.
///
/// Every successful [`acquire`](Self::acquire) must be paired with one
/// [`release`](Self::release); prefer [`acquire_slot`](Self::acquire_slot),
/// whose guard releases on drop.
#[derive(Debug)]
pub struct RequestQueue {
    max_concurrent: usize,
    counts: Mutex<Counts>,
    slot_freed: Condvar,
}

impl RequestQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            counts: Mutex::new(Counts::default()),
            slot_freed: Condvar::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_concurrent)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Block until a slot is free or `timeout` elapses.
    ///
    /// Returns whether a slot was obtained; a timed-out call has no side
    /// effects.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let mut counts = self.counts.lock();
        counts.waiting += 1;

        let max = self.max_concurrent;
        self.slot_freed
            .wait_while_for(&mut counts, |c| c.processing >= max, timeout);

        counts.waiting -= 1;
        if counts.processing < max {
            counts.processing += 1;
            debug!(processing = counts.processing, max, "queue slot acquired");
            true
        } else {
            debug!(timeout_ms = timeout.as_millis() as u64, "queue slot wait timed out");
            false
        }
    }

    /// Return a slot obtained by a successful [`acquire`](Self::acquire).
    pub fn release(&self) {
        let mut counts = self.counts.lock();
        if counts.processing == 0 {
            warn!("queue release without a held slot");
            return;
        }
        counts.processing -= 1;
        drop(counts);
        self.slot_freed.notify_one();
    }

    /// Scoped [`acquire`](Self::acquire): the slot is released when the guard
    /// drops.
    pub fn acquire_slot(&self, timeout: Duration) -> Option<QueueSlot<'_>> {
        if self.acquire(timeout) {
            Some(QueueSlot { queue: self })
        } else {
            None
        }
    }

    pub fn status(&self) -> QueueStatus {
        let counts = self.counts.lock();
        QueueStatus {
            max_concurrent: self.max_concurrent,
            currently_processing: counts.processing,
            waiting_in_queue: counts.waiting,
            available_slots: self.max_concurrent.saturating_sub(counts.processing),
        }
    }
}

/// Held queue slot; released on drop.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct QueueSlot<'a> {
    queue: &'a RequestQueue,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn second_acquire_times_out_while_slot_held() {
        let queue = Arc::new(RequestQueue::new(1));
        assert!(queue.acquire(Duration::from_millis(100)));
        assert_eq!(queue.status().available_slots, 0);

        let contender = queue.clone();
        let started = Instant::now();
        let acquired = thread::spawn(move || contender.acquire(Duration::from_millis(100)))
            .join()
            .unwrap();
        let waited = started.elapsed();

        assert!(!acquired);
        assert!(waited >= Duration::from_millis(90), "waited only {waited:?}");
        assert!(waited < Duration::from_secs(2));
        assert_eq!(queue.status().currently_processing, 1);
        assert_eq!(queue.status().waiting_in_queue, 0);

        queue.release();
        assert_eq!(queue.status().available_slots, 1);
    }

    #[test]
    fn waiter_is_woken_by_release() {
        let queue = Arc::new(RequestQueue::new(1));
        assert!(queue.acquire(Duration::ZERO));

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.acquire(Duration::from_secs(5)))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.status().waiting_in_queue == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.status().waiting_in_queue, 1);

        queue.release();
        assert!(waiter.join().unwrap());
        assert_eq!(queue.status().currently_processing, 1);
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let queue = RequestQueue::new(2);
        {
            let _a = queue.acquire_slot(Duration::ZERO).unwrap();
            let _b = queue.acquire_slot(Duration::ZERO).unwrap();
            assert!(queue.acquire_slot(Duration::ZERO).is_none());
            assert_eq!(queue.status().available_slots, 0);
        }
        assert_eq!(queue.status().available_slots, 2);
    }

    #[test]
    fn unmatched_release_is_ignored() {
        let queue = RequestQueue::new(1);
        queue.release();
        let status = queue.status();
        assert_eq!(status.currently_processing, 0);
        assert_eq!(status.available_slots, 1);
    }

    #[test]
    fn concurrency_never_exceeds_capacity() {
        let queue = Arc::new(RequestQueue::new(3));
        let peak = Arc::new(Mutex::new(0usize));

        let workers: Vec<_> = (0..12)
            .map(|_| {
                let queue = queue.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let _slot = queue.acquire_slot(Duration::from_secs(10)).unwrap();
                    let now = queue.status().currently_processing;
                    {
                        let mut peak = peak.lock();
                        *peak = (*peak).max(now);
                    }
                    thread::sleep(Duration::from_millis(10));
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(*peak.lock() <= 3);
        assert_eq!(queue.status().currently_processing, 0);
    }

    #[test]
    fn config_requires_capacity() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig::new(0).validate().is_err());
    }
}
