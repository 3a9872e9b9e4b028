//! Stage-clock hold tracking.
//!
//! While a blocking gate is parked, stage timeouts must not accrue.
//! Gates take a [`HoldGuard`] for the duration of the park; the
//! supervisor checks [`HoldCounter::held`] each tick and stops the
//! clock while any guard is alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared count of currently parked blocking gates.
#[derive(Debug, Clone, Default)]
pub struct HoldCounter {
    count: Arc<AtomicUsize>,
}

impl HoldCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn hold(&self) -> HoldGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        HoldGuard {
            count: Arc::clone(&self.count),
        }
    }
}

/// Releases its hold when dropped, including on cancellation.
#[derive(Debug)]
pub struct HoldGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest_and_release() {
        let counter = HoldCounter::new();
        assert_eq!(counter.held(), 0);

        let outer = counter.hold();
        let inner = counter.hold();
        assert_eq!(counter.held(), 2);

        drop(inner);
        assert_eq!(counter.held(), 1);
        drop(outer);
        assert_eq!(counter.held(), 0);
    }

    #[test]
    fn clones_share_the_count() {
        let counter = HoldCounter::new();
        let shared = counter.clone();
        let _guard = counter.hold();
        assert_eq!(shared.held(), 1);
    }
}
