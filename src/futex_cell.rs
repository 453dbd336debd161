//! The lock word shared by the kernel and the lock algorithms.
//!
//! A [`FutexCell`] is laid out the way the kernel's robust-futex walker reads
//! it: the list node comes first, and the 32-bit word sits
//! [`FutexCell::VALUE_OFFSET`] bytes after it. See
//! <https://docs.kernel.org/locking/robust-futex-ABI.html>.
//!
//! Locking and unlocking a cell is split in two:
//! - the robust-list bookkeeping in [`FutexCell::lock`] and
//!   [`FutexCell::unlock`], identical for every lock type;
//! - the compare-and-swap protocol on the word, supplied by a
//!   [`LockAlgorithm`].

use std::{
    fmt,
    mem::{align_of, offset_of},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use libc::c_long;

use crate::{
    futex::{FUTEX_TID_MASK, tid},
    robust_list::{RobustList, RobustListNode},
};

/// How a lock type takes and gives back the word of a [`FutexCell`].
pub(crate) trait LockAlgorithm {
    /// Return only once the word records `me` as its owner.
    fn acquire(cell: &FutexCell, me: u32);

    /// Give up ownership. `me` has already been checked to own the word.
    fn release(cell: &FutexCell, me: u32);
}

#[repr(C)]
pub struct FutexCell {
    /// Must be the first field: the kernel treats the cell's address as a
    /// `struct robust_list *`.
    pub(crate) link: RobustListNode,
    pub(crate) prev: AtomicPtr<RobustListNode>,
    value: AtomicU32,
}

const _: () = {
    assert!(offset_of!(FutexCell, link) == 0);
    assert!(offset_of!(FutexCell, value) % align_of::<u32>() == 0);
    assert!(FutexCell::VALUE_OFFSET > 0);
};

impl FutexCell {
    /// Byte offset from a cell's list node to its lock word, handed to the
    /// kernel as `futex_offset`.
    pub const VALUE_OFFSET: c_long =
        (offset_of!(FutexCell, value) as isize - offset_of!(FutexCell, link) as isize) as c_long;

    pub const fn new(value: u32) -> Self {
        Self {
            link: RobustListNode::new(),
            prev: AtomicPtr::new(std::ptr::null_mut()),
            value: AtomicU32::new(value),
        }
    }

    #[inline]
    pub(crate) fn node(&self) -> *mut RobustListNode {
        &self.link as *const _ as *mut RobustListNode
    }

    #[inline]
    pub(crate) const fn from_node(node: *const RobustListNode) -> *const FutexCell {
        node.cast()
    }

    #[inline]
    pub(crate) fn word(&self) -> &AtomicU32 {
        &self.value
    }

    /// Point-in-time read of the lock word. Diagnostics only.
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Thread id recorded in the word, `0` if none.
    pub fn owner(&self) -> u32 {
        self.value() & FUTEX_TID_MASK
    }

    /// Take the cell with `A`, keeping the kernel's view of the calling
    /// thread's robust list consistent at every step.
    pub(crate) fn lock<A: LockAlgorithm>(&self) {
        let me = tid();
        RobustList::with(|list| {
            // covers a death while we sit in `acquire`
            list.set_pending(Some(self));
            A::acquire(self, me);
            // only ever link a cell we own
            unsafe { list.link(self) };
            list.set_pending(None);
        });
    }

    /// Release the cell with `A`.
    ///
    /// The cell stays pending from before it is unlinked until after the word
    /// is released, so a death at any point in between still hands the word
    /// to the kernel. A caller that does not own the cell is reported and
    /// nothing is touched.
    pub(crate) fn unlock<A: LockAlgorithm>(&self) {
        let me = tid();
        let owner = self.owner();
        if owner != me {
            log::error!("thread {me} unlocking {self:p} owned by {owner}");
            return;
        }

        RobustList::with(|list| {
            list.set_pending(Some(self));
            // A word can carry our tid without being in our list: a thread
            // that died unregistered left it behind and the tid was reused.
            if list.contains(self) {
                unsafe { list.unlink(self) };
            } else {
                log::error!("{self:p} holds tid {me} but is not in its robust list");
            }
            A::release(self, me);
            list.set_pending(None);
        });
    }
}

impl Drop for FutexCell {
    fn drop(&mut self) {
        if self.owner() != tid() {
            return;
        }
        log::error!("dropping {self:p} while this thread holds it");
        RobustList::with(|list| {
            if list.contains(self) {
                // still at the address it was linked at
                unsafe { list.unlink(self) };
            }
        });
    }
}

impl fmt::Debug for FutexCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.value();
        f.debug_struct("FutexCell")
            .field("owner", &(v & FUTEX_TID_MASK))
            .field("flags", &format_args!("{:#x}", v & !FUTEX_TID_MASK))
            .field("word", &self.value.as_ptr())
            .field("prev", &self.prev.load(Ordering::Relaxed))
            .field("next", &self.link.next.load(Ordering::Relaxed))
            .finish()
    }
}
