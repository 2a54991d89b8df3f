use std::sync::{Condvar, Mutex};

use crate::error::{DustError, Result};

/// Semaphore-style cap on in-flight chunk buffers.
///
/// The producer acquires a slot before dispatching a chunk to the worker pool
/// and the consumer releases it once the chunk's result is committed, so the
/// pipeline holds at most `capacity` chunk payloads at a time.
pub(crate) struct SlotBudget {
    state: Mutex<SlotState>,
    freed: Condvar,
}

struct SlotState {
    available: usize,
    capacity: usize,
    poisoned: bool,
}

impl SlotBudget {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                available: capacity,
                capacity,
                poisoned: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is free, then take it. Returns `Err` once the
    /// budget has been poisoned.
    pub(crate) fn acquire(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.poisoned {
                return Err(DustError::Interrupted);
            }
            if st.available > 0 {
                st.available -= 1;
                return Ok(());
            }
            st = self.freed.wait(st).unwrap();
        }
    }

    /// Return a slot and wake any blocked producer.
    pub(crate) fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.available = (st.available + 1).min(st.capacity);
        self.freed.notify_all();
    }

    /// Fail all current and future `acquire` calls. Used to stop the producer
    /// once the pipeline has hit a hard error.
    pub(crate) fn poison(&self) {
        let mut st = self.state.lock().unwrap();
        st.poisoned = true;
        self.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn acquire_release_cycle() {
        let budget = SlotBudget::new(2);
        budget.acquire().unwrap();
        budget.acquire().unwrap();
        budget.release();
        budget.acquire().unwrap();
        budget.release();
        budget.release();
    }

    #[test]
    fn blocks_until_released() {
        let budget = Arc::new(SlotBudget::new(1));
        budget.acquire().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);
        let budget2 = Arc::clone(&budget);

        let handle = std::thread::spawn(move || {
            budget2.acquire().unwrap();
            acquired2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "should be blocked");

        budget.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn poison_unblocks_waiters() {
        let budget = Arc::new(SlotBudget::new(1));
        budget.acquire().unwrap();

        let budget2 = Arc::clone(&budget);
        let handle = std::thread::spawn(move || budget2.acquire());

        std::thread::sleep(std::time::Duration::from_millis(50));
        budget.poison();
        assert!(handle.join().unwrap().is_err());
        assert!(budget.acquire().is_err(), "poisoning is permanent");
    }
}
