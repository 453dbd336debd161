use std::sync::atomic::Ordering;

use nix::errno::Errno;

use crate::{
    futex::{FUTEX_OWNER_DIED, FUTEX_TID_MASK, FUTEX_WAITERS, sys, tid},
    futex_cell::{FutexCell, LockAlgorithm},
    lock::LockGuard,
};

/// A blocking lock on a futex word whose holder's death hands it to the next
/// locker instead of deadlocking.
///
/// The word moves through `0` → `tid` → `tid | FUTEX_WAITERS`, and the kernel
/// turns a dead holder's word into `FUTEX_OWNER_DIED` (keeping the waiter
/// bit). Waiters are woken one per release, in no particular order.
pub struct RobustMutex {
    cell: FutexCell,
}

impl RobustMutex {
    pub const fn new() -> Self {
        Self {
            cell: FutexCell::new(0),
        }
    }

    /// Block until the calling thread owns the mutex. Not re-entrant.
    ///
    /// The mutex stays in place while it is held:
    ///
    /// ```compile_fail
    /// let mutex = robust_futex::RobustMutex::new();
    /// let guard = mutex.lock();
    /// let moved = Box::new(mutex);
    /// drop(guard);
    /// ```
    pub fn lock(&self) -> LockGuard<'_, Self> {
        self.cell.lock::<Blocking>();
        LockGuard::new(self)
    }

    /// Unlocking a mutex the caller does not hold is logged and ignored.
    ///
    /// # Safety
    ///
    /// If the calling thread holds the mutex, the mutex must not have moved
    /// since it was locked.
    pub unsafe fn unlock(&self) {
        self.cell.unlock::<Blocking>();
    }

    pub fn is_locked(&self) -> bool {
        self.cell.owner() != 0
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.cell.owner() == tid()
    }

    /// The last holder died without unlocking, and nobody has taken it since.
    pub fn owner_died(&self) -> bool {
        self.cell.value() & FUTEX_OWNER_DIED != 0
    }

    pub fn has_waiters(&self) -> bool {
        self.cell.value() & FUTEX_WAITERS != 0
    }

    pub fn owner(&self) -> Option<u32> {
        Some(self.cell.owner()).filter(|tid| *tid != 0)
    }

    pub fn cell(&self) -> &FutexCell {
        &self.cell
    }
}

impl Default for RobustMutex {
    fn default() -> Self {
        Self::new()
    }
}

struct Blocking;

impl LockAlgorithm for Blocking {
    fn acquire(cell: &FutexCell, me: u32) {
        let word = cell.word();
        // After sleeping once, other threads may still be asleep behind us, so
        // the word keeps its waiter bit and our release wakes the next one.
        let mut waiters = 0;
        loop {
            let current = match word.compare_exchange(
                0,
                me | waiters,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    log::trace!("acquired unlocked mutex {cell:p}");
                    return;
                }
                Err(v) => v,
            };

            if current & FUTEX_OWNER_DIED != 0 {
                let recovered = me | (current & FUTEX_WAITERS) | waiters;
                if word
                    .compare_exchange(current, recovered, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    log::info!("acquired mutex {cell:p} w/ owner died");
                    return;
                }
                continue;
            }

            // Only flag a word that still has this owner, otherwise a
            // waiter bit could land on a free word nobody will wake.
            let contended = current | FUTEX_WAITERS;
            if current != contended
                && word
                    .compare_exchange(current, contended, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }

            log::trace!(
                "waiting for {} on mutex {cell:p}",
                contended & FUTEX_TID_MASK
            );
            match sys::wait(word, contended) {
                Ok(()) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(e) => log::warn!("FUTEX_WAIT {cell:p} failed: {e}"),
            }
            waiters = FUTEX_WAITERS;
        }
    }

    fn release(cell: &FutexCell, me: u32) {
        let word = cell.word();
        let current = match word.compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => {
                log::trace!("released mutex {cell:p} w/ no waiters");
                return;
            }
            Err(v) => v,
        };

        if current & !FUTEX_WAITERS != me {
            log::error!(
                "unlocking mutex {cell:p} owned by {}",
                current & FUTEX_TID_MASK
            );
            return;
        }

        if let Err(v) = word.compare_exchange(current, 0, Ordering::Release, Ordering::Relaxed) {
            log::error!("unlocking mutex {cell:p} changed under its owner: {v:#x}");
            return;
        }

        // Waking nobody is benign: the waiter bit can outlive the last
        // sleeper, or the kernel's owner-died wake may have reached it first.
        match sys::wake(word, 1) {
            Ok(0) => log::debug!("released mutex {cell:p}, no waiter left to wake"),
            Ok(_) => log::trace!("released mutex {cell:p} and woke a waiter"),
            Err(e) => log::warn!("FUTEX_WAKE {cell:p} failed: {e}"),
        }
    }
}
