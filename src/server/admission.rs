//! Bounded admission queue between the acceptor and the workers.
//!
//! A fixed-capacity ring of signaling tokens guarded by a mutex, gated
//! by an `empty`/`filled` counting-semaphore pair. The acceptor performs
//! a single non-blocking decrement of `empty` per connection; failure
//! means the queue is saturated and the connection is rejected with 503.
//!
//! The token is a signal, not the connection itself: the accepted stream
//! travels out-of-band over the selected worker's channel. Tokens are
//! anonymous while connections are per-worker, so workers never *wait*
//! on the shared `filled` gate — a worker that won a permit paired with
//! another worker's connection would strand that connection on its
//! channel. Instead each worker blocks on its own channel and calls
//! [`AdmissionQueue::mark_delivered`] once it has taken a connection
//! off, consuming the oldest token and freeing its slot. Admission
//! strictly precedes the channel send, so at every delivery a token is
//! available; the queue therefore always counts exactly the admitted
//! connections no worker has picked up yet.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

/// A signaling token recording which worker the paired connection was
/// dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionToken {
    pub worker_id: usize,
}

struct Ring {
    slots: Vec<Option<AdmissionToken>>,
    front: usize,
    count: usize,
}

/// Fixed-capacity admission queue with semaphore backpressure.
///
/// Invariants (observable whenever the queue is quiescent):
/// `count + empty.permits == capacity` and `count == filled.permits`.
pub struct AdmissionQueue {
    capacity: usize,
    empty: Semaphore,
    filled: Semaphore,
    ring: Mutex<Ring>,
}

impl AdmissionQueue {
    /// Creates a queue of `capacity` slots (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            empty: Semaphore::new(capacity),
            filled: Semaphore::new(0),
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                front: 0,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempts to admit one connection. A single non-blocking decrement
    /// of the free-slot gate; on success the token is enqueued and the
    /// filled gate posted. Returns `false` when the queue is full (or
    /// closing), in which case the caller rejects the connection.
    #[must_use]
    pub fn try_admit(&self, token: AdmissionToken) -> bool {
        let Ok(permit) = self.empty.try_acquire() else {
            return false;
        };
        permit.forget();

        {
            let mut ring = self.lock();
            let back = (ring.front + ring.count) % self.capacity;
            ring.slots[back] = Some(token);
            ring.count += 1;
        }

        self.filled.add_permits(1);
        true
    }

    /// Records that a worker took delivery of an admitted connection
    /// from its channel: consumes the oldest token and frees its slot
    /// for the next admission.
    ///
    /// Never blocks. Admission precedes the channel send that delivery
    /// observed, so a token is always present; `None` means the queue is
    /// closing and the bookkeeping no longer matters.
    pub fn mark_delivered(&self) -> Option<AdmissionToken> {
        let Ok(permit) = self.filled.try_acquire() else {
            return None;
        };
        permit.forget();

        let token = {
            let mut ring = self.lock();
            let front = ring.front;
            let token = ring.slots[front].take();
            ring.front = (front + 1) % self.capacity;
            ring.count -= 1;
            token
        };

        self.empty.add_permits(1);
        token
    }

    /// Closes both gates so no further admissions succeed.
    pub fn close(&self) {
        self.filled.close();
        self.empty.close();
    }

    /// Number of tokens currently queued.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock().count
    }

    /// Configured slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    fn gate_permits(&self) -> (usize, usize) {
        (self.empty.available_permits(), self.filled.available_permits())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token(worker_id: usize) -> AdmissionToken {
        AdmissionToken { worker_id }
    }

    #[test]
    fn test_capacity_floor_is_one() {
        let queue = AdmissionQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_admit_delivery_fifo() {
        let queue = AdmissionQueue::new(4);
        assert!(queue.try_admit(token(0)));
        assert!(queue.try_admit(token(1)));
        assert!(queue.try_admit(token(2)));

        assert_eq!(queue.mark_delivered(), Some(token(0)));
        assert_eq!(queue.mark_delivered(), Some(token(1)));
        assert_eq!(queue.mark_delivered(), Some(token(2)));
    }

    #[test]
    fn test_admit_fails_when_full() {
        let queue = AdmissionQueue::new(2);
        assert!(queue.try_admit(token(0)));
        assert!(queue.try_admit(token(1)));
        assert!(!queue.try_admit(token(0)), "third admit must be rejected");
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_slot_frees_after_delivery() {
        let queue = AdmissionQueue::new(1);
        assert!(queue.try_admit(token(0)));
        assert!(!queue.try_admit(token(0)));
        queue.mark_delivered().unwrap();
        assert!(queue.try_admit(token(0)));
    }

    #[test]
    fn test_conservation_invariant() {
        let queue = AdmissionQueue::new(3);
        let check = |queue: &AdmissionQueue| {
            let (empty, filled) = queue.gate_permits();
            assert_eq!(queue.depth() + empty, queue.capacity());
            assert_eq!(queue.depth(), filled);
        };

        check(&queue);
        assert!(queue.try_admit(token(0)));
        check(&queue);
        assert!(queue.try_admit(token(1)));
        check(&queue);
        queue.mark_delivered().unwrap();
        check(&queue);
        queue.mark_delivered().unwrap();
        check(&queue);
    }

    #[test]
    fn test_ring_wraps_around() {
        let queue = AdmissionQueue::new(2);
        for round in 0..5 {
            assert!(queue.try_admit(token(round)));
            assert_eq!(queue.mark_delivered(), Some(token(round)));
        }
    }

    #[test]
    fn test_closed_queue_rejects_admits() {
        let queue = AdmissionQueue::new(2);
        queue.close();
        assert!(!queue.try_admit(token(0)));
    }

    #[test]
    fn test_mark_delivered_after_close_returns_none() {
        let queue = AdmissionQueue::new(2);
        assert!(queue.try_admit(token(0)));
        queue.close();
        assert_eq!(queue.mark_delivered(), None);
    }
}
