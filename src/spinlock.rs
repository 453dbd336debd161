use std::{hint, sync::atomic::Ordering};

use crate::{
    futex::{FUTEX_OWNER_DIED, tid},
    futex_cell::{FutexCell, LockAlgorithm},
    lock::LockGuard,
};

/// The free word. It is exactly what the kernel writes when a holder dies
/// (no waiter bit is ever set on a spinlock), so an abandoned spinlock is
/// simply free again.
pub const UNLOCKED: u32 = FUTEX_OWNER_DIED;

/// A busy-waiting lock whose holder's death releases it.
///
/// Not re-entrant: locking it twice from one thread spins forever.
pub struct RobustSpinlock {
    cell: FutexCell,
}

impl RobustSpinlock {
    pub const fn new() -> Self {
        Self {
            cell: FutexCell::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> LockGuard<'_, Self> {
        self.cell.lock::<Spin>();
        LockGuard::new(self)
    }

    /// Unlocking a spinlock the caller does not hold is logged and ignored.
    ///
    /// # Safety
    ///
    /// If the calling thread holds the spinlock, it must not have moved since
    /// it was locked.
    pub unsafe fn unlock(&self) {
        self.cell.unlock::<Spin>();
    }

    pub fn is_locked(&self) -> bool {
        self.cell.owner() != 0
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.cell.owner() == tid()
    }

    pub fn cell(&self) -> &FutexCell {
        &self.cell
    }
}

impl Default for RobustSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

struct Spin;

impl LockAlgorithm for Spin {
    fn acquire(cell: &FutexCell, me: u32) {
        let word = cell.word();
        while word
            .compare_exchange_weak(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // wait for a free word before trying the CAS again
            while word.load(Ordering::Relaxed) != UNLOCKED {
                hint::spin_loop();
            }
        }
        log::trace!("acquired spinlock {cell:p}");
    }

    fn release(cell: &FutexCell, me: u32) {
        match cell
            .word()
            .compare_exchange(me, UNLOCKED, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => log::trace!("released spinlock {cell:p}"),
            Err(v) => log::warn!("released spinlock {cell:p} not held by {me}: {v:#x}"),
        }
    }
}
