use std::{marker::PhantomData, ops::Deref};

use crate::{mutex::RobustMutex, spinlock::RobustSpinlock};

/// The operations shared by every robust lock.
pub trait RobustLock {
    /// Take the lock. The guard borrows it, so a held lock cannot move or be
    /// dropped while it is linked into this thread's robust list. A forgotten
    /// guard leaves the lock linked: it must then stay in place until
    /// [`unlock`](RobustLock::unlock) or until the thread exits.
    fn lock(&self) -> LockGuard<'_, Self>
    where
        Self: Sized;

    /// Release the lock without a guard. A caller that does not hold the lock
    /// gets an error log and no state change.
    ///
    /// # Safety
    ///
    /// If the calling thread holds the lock, the lock must not have moved
    /// since it was taken (e.g. after `mem::forget` on its guard).
    unsafe fn unlock(&self);

    /// Best-effort, point-in-time answer. Diagnostics only.
    fn is_locked(&self) -> bool;
}

impl RobustLock for RobustSpinlock {
    fn lock(&self) -> LockGuard<'_, Self> {
        RobustSpinlock::lock(self)
    }
    unsafe fn unlock(&self) {
        unsafe { RobustSpinlock::unlock(self) }
    }
    fn is_locked(&self) -> bool {
        RobustSpinlock::is_locked(self)
    }
}

impl RobustLock for RobustMutex {
    fn lock(&self) -> LockGuard<'_, Self> {
        RobustMutex::lock(self)
    }
    unsafe fn unlock(&self) {
        unsafe { RobustMutex::unlock(self) }
    }
    fn is_locked(&self) -> bool {
        RobustMutex::is_locked(self)
    }
}

/// Unlocks on drop. Must be dropped by the thread that locked.
pub struct LockGuard<'a, L: RobustLock> {
    lock: &'a L,
    _not_send: PhantomData<*const ()>,
}

impl<'a, L: RobustLock> LockGuard<'a, L> {
    pub(crate) fn new(lock: &'a L) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<L: RobustLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        // the borrow kept the lock in place since it was taken
        unsafe { self.lock.unlock() };
    }
}

impl<L: RobustLock> Deref for LockGuard<'_, L> {
    type Target = L;
    fn deref(&self) -> &Self::Target {
        self.lock
    }
}
