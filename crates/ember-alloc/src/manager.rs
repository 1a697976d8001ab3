//! Memory manager seam.
//!
//! The allocator never decides what to evict; it asks a [`MemoryManager`]
//! for budget and reports what it gives back. The production manager sits
//! in front of the cache's eviction policy; [`BudgetManager`] is the
//! self-contained accounting implementation used when no eviction layer is
//! wired in.

use std::time::Duration;

use ember_common::constants::DEFAULT_RESERVE_TIMEOUT_MS;
use parking_lot::{Condvar, Mutex};

/// Reserves and releases bytes against a global cache budget.
///
/// `reserve_memory` with `wait = true` may block while the implementation
/// evicts; returning `false` means the budget refused the reservation.
/// Refusals are expected under pressure and must not be treated as errors
/// by implementations.
pub trait MemoryManager: Send + Sync {
    /// Tries to reserve `bytes` against the budget. May block (waiting for
    /// eviction) when `wait` is true. Returns false on refusal.
    fn reserve_memory(&self, bytes: usize, wait: bool) -> bool;

    /// Returns `bytes` to the budget.
    fn release_memory(&self, bytes: usize);

    /// Informs the manager of the budget ceiling it should enforce.
    fn update_max_size(&self, bytes: usize);

    /// A human-readable accounting snapshot for out-of-memory diagnostics.
    fn debug_dump_for_oom(&self) -> String;
}

#[derive(Debug)]
struct Budget {
    used: usize,
    max: usize,
}

/// A plain budget tracker.
///
/// Keeps a `used` counter under a mutex; blocking reservations wait on a
/// condvar that release and ceiling updates signal. Releases saturate at
/// zero: buffers served from already-materialized arena space reserve only
/// their shortfall, so over a pool's lifetime releases can outnumber
/// reserves.
#[derive(Debug)]
pub struct BudgetManager {
    budget: Mutex<Budget>,
    released: Condvar,
    wait_timeout: Duration,
}

impl BudgetManager {
    /// Creates a tracker with the given ceiling.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            budget: Mutex::new(Budget {
                used: 0,
                max: max_bytes,
            }),
            released: Condvar::new(),
            wait_timeout: Duration::from_millis(DEFAULT_RESERVE_TIMEOUT_MS),
        }
    }

    /// Overrides how long a blocking reservation waits before refusing.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.budget.lock().used
    }

    /// The current ceiling.
    pub fn max(&self) -> usize {
        self.budget.lock().max
    }

    /// Bytes still available under the ceiling.
    pub fn available(&self) -> usize {
        let budget = self.budget.lock();
        budget.max.saturating_sub(budget.used)
    }
}

impl MemoryManager for BudgetManager {
    fn reserve_memory(&self, bytes: usize, wait: bool) -> bool {
        let mut budget = self.budget.lock();
        loop {
            if budget.used + bytes <= budget.max {
                budget.used += bytes;
                return true;
            }
            if !wait {
                return false;
            }
            let timed_out = self
                .released
                .wait_for(&mut budget, self.wait_timeout)
                .timed_out();
            if timed_out {
                return false;
            }
        }
    }

    fn release_memory(&self, bytes: usize) {
        let mut budget = self.budget.lock();
        budget.used = budget.used.saturating_sub(bytes);
        drop(budget);
        self.released.notify_all();
    }

    fn update_max_size(&self, bytes: usize) {
        let mut budget = self.budget.lock();
        budget.max = bytes;
        drop(budget);
        self.released.notify_all();
    }

    fn debug_dump_for_oom(&self) -> String {
        let budget = self.budget.lock();
        format!("budget: {} of {} bytes reserved", budget.used, budget.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reserve_and_release() {
        let manager = BudgetManager::new(1000);

        assert!(manager.reserve_memory(600, false));
        assert_eq!(manager.used(), 600);
        assert_eq!(manager.available(), 400);

        assert!(!manager.reserve_memory(500, false));
        assert_eq!(manager.used(), 600);

        manager.release_memory(200);
        assert!(manager.reserve_memory(500, false));
        assert_eq!(manager.used(), 900);
    }

    #[test]
    fn test_release_saturates() {
        let manager = BudgetManager::new(1000);
        manager.reserve_memory(100, false);
        manager.release_memory(400);
        assert_eq!(manager.used(), 0);
    }

    #[test]
    fn test_update_max_size() {
        let manager = BudgetManager::new(100);
        assert!(!manager.reserve_memory(200, false));

        manager.update_max_size(400);
        assert!(manager.reserve_memory(200, false));
        assert_eq!(manager.max(), 400);
    }

    #[test]
    fn test_wait_times_out() {
        let manager = BudgetManager::new(100).with_wait_timeout(Duration::from_millis(20));
        assert!(manager.reserve_memory(100, false));
        // Nothing will release; the blocking reservation must give up.
        assert!(!manager.reserve_memory(1, true));
    }

    #[test]
    fn test_wait_unblocks_on_release() {
        let manager = Arc::new(BudgetManager::new(100));
        assert!(manager.reserve_memory(100, false));

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.reserve_memory(50, true))
        };

        thread::sleep(Duration::from_millis(10));
        manager.release_memory(100);

        assert!(waiter.join().unwrap());
        assert_eq!(manager.used(), 50);
    }

    #[test]
    fn test_debug_dump() {
        let manager = BudgetManager::new(256);
        manager.reserve_memory(64, false);
        assert_eq!(
            manager.debug_dump_for_oom(),
            "budget: 64 of 256 bytes reserved"
        );
    }
}
