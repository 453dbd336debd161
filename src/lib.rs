//! Robust spinlock and mutex on Linux futexes and the kernel's robust list.
//!
//! A thread that dies holding one of these locks does not deadlock the
//! others: the kernel walks the dead thread's robust list and flags the lock
//! word `FUTEX_OWNER_DIED`, which the next locker takes over.

#[cfg(not(target_os = "linux"))]
compile_error!("robust_futex needs Linux futexes and set_robust_list(2)");

pub mod futex;
mod futex_cell;
mod lock;
mod mutex;
mod process;
mod robust_list;
mod shared_mem;
mod spinlock;

pub use futex::{FUTEX_OWNER_DIED, FUTEX_TID_MASK, FUTEX_WAITERS, tid};
pub use futex_cell::FutexCell;
pub use lock::{LockGuard, RobustLock};
pub use mutex::RobustMutex;
pub use process::fork_and_wait;
pub use robust_list::RobustList;
pub use shared_mem::SharedMemory;
pub use spinlock::{RobustSpinlock, UNLOCKED as SPINLOCK_UNLOCKED};
