//! A fixed-capacity, never-blocking semaphore bounding the level-compaction worker pool.
//!
//! A bounded channel pre-loaded with `capacity` tokens gives `try_recv`/`send` semantics for
//! free, which is exactly try-take/release.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

pub struct Limiter {
    tokens: Receiver<()>,
    release: Sender<()>,
    capacity: usize,
}

/// A held token; releases automatically on drop so a panicking or early-returning compaction
/// task cannot leak capacity. Owns a cloned sender (cheap: a `crossbeam_channel::Sender` is just
/// a shared queue handle) so it can be moved onto the worker thread that runs the compaction.
pub struct Permit {
    release: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.release.send(());
    }
}

impl Limiter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = tx.send(());
        }
        Self { tokens: rx, release: tx, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking acquire. `None` means the pool is fully occupied; the caller (the
    /// level-compaction loop) retries on its next tick rather than waiting.
    pub fn try_take(&self) -> Option<Permit> {
        match self.tokens.try_recv() {
            Ok(()) => Some(Permit { release: self.release.clone() }),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_replenishes_capacity() {
        let limiter = Limiter::new(2);
        let first = limiter.try_take().unwrap();
        let second = limiter.try_take().unwrap();
        assert!(limiter.try_take().is_none());
        drop(first);
        assert!(limiter.try_take().is_some());
        drop(second);
    }

    #[test]
    fn capacity_floors_at_one() {
        let limiter = Limiter::new(0);
        assert_eq!(limiter.capacity(), 1);
    }
}
