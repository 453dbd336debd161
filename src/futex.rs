//! futex.rs – raw `futex(2)` / `set_robust_list(2)` glue and thread identity.
//!
//! Everything here is a thin wrapper over the kernel; the lock protocol lives
//! in [`crate::futex_cell`].

use std::{
    cell::Cell,
    mem,
    ptr,
    sync::{Once, atomic::AtomicU32},
};

use libc::{self, c_int, c_long};
use nix::errno::Errno;

use crate::robust_list::{RobustList, RobustListHead};

// ---- kernel constants --------------------------------------------------------------------
pub const FUTEX_WAIT: c_int = libc::FUTEX_WAIT;
pub const FUTEX_WAKE: c_int = libc::FUTEX_WAKE;

/// Set in a lock word while at least one thread sleeps in `FUTEX_WAIT` on it.
pub const FUTEX_WAITERS: u32 = libc::FUTEX_WAITERS;
/// Set by the kernel when the owner recorded in the word exited without unlocking.
pub const FUTEX_OWNER_DIED: u32 = libc::FUTEX_OWNER_DIED;
/// Bits of a lock word that hold the owner's thread id.
pub const FUTEX_TID_MASK: u32 = libc::FUTEX_TID_MASK;

thread_local! {
    static MY_TID: Cell<u32> = const { Cell::new(0) };
}

#[inline]
fn gettid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Kernel thread id of the caller, resolved once per thread.
///
/// Never zero: zero in a lock word means "unlocked".
pub fn tid() -> u32 {
    static ATFORK: Once = Once::new();

    // fast path
    if let Some(id) = MY_TID.try_with(Cell::get).ok().filter(|id| *id != 0) {
        return id;
    }

    // slow initialisation
    let id = gettid();
    debug_assert!(id != 0 && id & !FUTEX_TID_MASK == 0, "tid {id} does not fit the tid mask");
    MY_TID.with(|t| t.set(id));

    ATFORK.call_once(|| {
        let rc = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
        if rc != 0 {
            log::warn!("pthread_atfork failed: {}", Errno::from_raw(rc));
        }
    });

    id
}

/// The child of a `fork` is a new thread: its id differs, and the kernel has
/// dropped the parent's robust list registration for it.
unsafe extern "C" fn atfork_child() {
    let _ = MY_TID.try_with(|t| t.set(0));
    RobustList::reset_after_fork();
}

// ---- raw futex syscall --------------------------------------------------------------------
unsafe fn futex_raw(
    uaddr: *const u32,
    op: c_int,
    val: c_int,
    val2: usize,
    uaddr2: *const u32,
    val3: c_int,
) -> nix::Result<c_long> {
    let ret = unsafe { libc::syscall(libc::SYS_futex, uaddr, op, val, val2, uaddr2, val3) };
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

pub mod sys {
    use super::*;

    /// Sleep until woken, as long as `*word == expected` when the kernel looks.
    ///
    /// Not `FUTEX_PRIVATE_FLAG`: the kernel's owner-died wake is a shared wake,
    /// and the word may live in memory mapped by several processes.
    #[inline]
    pub fn wait(word: &AtomicU32, expected: u32) -> nix::Result<()> {
        unsafe {
            futex_raw(
                word.as_ptr(),
                FUTEX_WAIT,
                expected as c_int,
                0,
                ptr::null(),
                0,
            )
        }
        .map(|_| ())
    }

    /// Wake up to `n` threads sleeping on `word`; returns how many were woken.
    #[inline]
    pub fn wake(word: &AtomicU32, n: i32) -> nix::Result<i32> {
        unsafe { futex_raw(word.as_ptr(), FUTEX_WAKE, n, 0, ptr::null(), 0) }.map(|v| v as i32)
    }

    /// Tell the kernel where this thread's robust list head lives.
    ///
    /// # Safety
    ///
    /// `head` must stay valid, at the same address, until the thread exits.
    #[inline]
    pub unsafe fn set_robust_list(head: *const RobustListHead) -> nix::Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_robust_list,
                head,
                mem::size_of::<RobustListHead>(),
            )
        };
        Errno::result(ret).map(drop)
    }
}
