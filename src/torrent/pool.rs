//! Connection worker pool
//!
//! Bounded admission for the connect+handshake phase. A slot is held only
//! while a peer is being dialed and handshaken; once a connection reaches
//! its steady-state read loop the permit is returned, so the pool gates
//! the churn-heavy phase without capping the connected population.
//!
//! One pool is owned by each swarm session. Nothing here is process-wide;
//! several sessions run side by side without cross-talk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded connect+handshake slots
pub struct ConnectPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    running: AtomicUsize,
}

/// A held connect slot; dropping it frees the slot
pub struct ConnectSlot {
    _permit: OwnedSemaphorePermit,
    pool: Arc<ConnectPool>,
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        self.pool.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
            running: AtomicUsize::new(0),
        })
    }

    /// Try to take a connect slot. `None` means the pool is saturated and
    /// the peer stays `New` until a later scheduler tick.
    pub fn dispatch(self: &Arc<Self>) -> Option<ConnectSlot> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(ConnectSlot {
            _permit: permit,
            pool: Arc::clone(self),
        })
    }

    /// Connect attempts currently holding a slot
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.capacity - self.running()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_is_bounded() {
        let pool = ConnectPool::new(2);
        assert_eq!(pool.available(), 2);

        let a = pool.dispatch().unwrap();
        let _b = pool.dispatch().unwrap();
        assert!(pool.dispatch().is_none());
        assert_eq!(pool.running(), 2);
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.running(), 1);
        assert!(pool.dispatch().is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pool = ConnectPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.dispatch().is_some());
    }
}
