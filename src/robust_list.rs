use std::{
    cell::Cell,
    fmt,
    mem::size_of,
    ptr,
    sync::atomic::{AtomicPtr, Ordering, compiler_fence},
};

use libc::c_long;

use crate::{futex::sys, futex_cell::FutexCell};

/// Kernel ABI for the single “link” node that every lock contributes.
/// SAFETY: Layout must match `struct robust_list` in <linux/futex.h>.
#[repr(C)]
pub struct RobustListNode {
    pub(crate) next: AtomicPtr<RobustListNode>,
}

impl RobustListNode {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Kernel ABI for the per‑thread head –– the kernel expects this exact layout.
#[repr(C)]
pub struct RobustListHead {
    list: RobustListNode,
    /// offset between &cell.link and &cell.value
    futex_offset: c_long,
    list_op_pending: AtomicPtr<RobustListNode>,
}

const _: () = assert!(size_of::<RobustListHead>() == 3 * size_of::<usize>());

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Registration {
    Fresh,
    Active,
    Failed,
}

/// The calling thread's list of held locks, as seen by the kernel at thread exit.
///
/// Only the owning thread mutates the list. The kernel reads it at an
/// arbitrary instruction boundary when the thread dies, so every mutation
/// below publishes with a single store of a `next` pointer.
pub struct RobustList {
    head: RobustListHead,
    registration: Cell<Registration>,
}

thread_local! {
    static ROBUST: RobustList = const { RobustList::new() };
}

impl RobustList {
    const fn new() -> Self {
        Self {
            head: RobustListHead {
                list: RobustListNode::new(),
                futex_offset: FutexCell::VALUE_OFFSET,
                list_op_pending: AtomicPtr::new(ptr::null_mut()),
            },
            registration: Cell::new(Registration::Fresh),
        }
    }

    /// Run `f` with the calling thread's robust list, registering it with the
    /// kernel on first use.
    pub fn with<R>(f: impl FnOnce(&RobustList) -> R) -> R {
        ROBUST.with(|list| {
            list.register();
            f(list)
        })
    }

    /// Return the sentinel value `next` has when the list is empty.
    #[inline]
    fn sentinel(&self) -> *mut RobustListNode {
        &self.head.list as *const _ as *mut RobustListNode
    }

    /// Run `f` with the calling thread's list as it is, registered or not.
    #[cfg(test)]
    pub(crate) fn with_unregistered<R>(f: impl FnOnce(&RobustList) -> R) -> R {
        ROBUST.with(f)
    }

    /// Hand the list to the kernel. Idempotent; a failure is logged and only
    /// costs owner-death cleanup for this thread.
    ///
    /// Without cleanup, a dead thread's locks keep its tid. Once the tid is
    /// reused, such a word looks held by the new thread without being in its
    /// list, which [`FutexCell`]'s unlock checks for.
    pub fn register(&self) {
        // the list lives in this thread's TLS block until the thread is gone
        self.register_with(|head| unsafe { sys::set_robust_list(head) });
    }

    pub(crate) fn register_with(
        &self,
        set_robust_list: impl FnOnce(*const RobustListHead) -> nix::Result<()>,
    ) {
        if self.registration.get() != Registration::Fresh {
            return;
        }
        self.head.list.next.store(self.sentinel(), Ordering::Relaxed);
        self.head.list_op_pending.store(ptr::null_mut(), Ordering::Relaxed);

        match set_robust_list(&self.head) {
            Ok(()) => {
                log::debug!("set_robust_list({:p})", &self.head);
                self.registration.set(Registration::Active);
            }
            Err(e) => {
                log::error!("set_robust_list failed: {e}");
                self.registration.set(Registration::Failed);
            }
        }
    }

    /// Whether the kernel will clean up this thread's locks when it dies.
    pub fn is_registered(&self) -> bool {
        self.registration.get() == Registration::Active
    }

    /// Forget the inherited list in a freshly forked child; it belongs to the
    /// parent's thread, and the kernel no longer knows about it.
    pub(crate) fn reset_after_fork() {
        let _ = ROBUST.try_with(|list| {
            list.head.list.next.store(ptr::null_mut(), Ordering::Relaxed);
            list.head
                .list_op_pending
                .store(ptr::null_mut(), Ordering::Relaxed);
            list.registration.set(Registration::Fresh);
        });
    }

    /// Record the cell this thread is in the middle of acquiring or releasing.
    pub fn set_pending(&self, cell: Option<&FutexCell>) {
        let node = cell.map_or(ptr::null_mut(), FutexCell::node);
        self.head.list_op_pending.store(node, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    pub fn pending(&self) -> *const FutexCell {
        self.head.list_op_pending.load(Ordering::Relaxed).cast()
    }

    /// Push `cell` at the front of the list.
    ///
    /// # Safety
    ///
    /// The calling thread must own `cell`, `cell` must not be linked into any
    /// list, and every cell already linked must still be alive.
    pub(crate) unsafe fn link(&self, cell: &FutexCell) {
        let sentinel = self.sentinel();
        let first = self.head.list.next.load(Ordering::Relaxed);

        cell.prev.store(sentinel, Ordering::Relaxed);
        cell.link.next.store(first, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        self.head.list.next.store(cell.node(), Ordering::Relaxed);

        if first != sentinel {
            unsafe { (*FutexCell::from_node(first)).prev.store(cell.node(), Ordering::Relaxed) };
        }
    }

    /// Remove `cell` from wherever it sits in the list.
    ///
    /// # Safety
    ///
    /// `cell` must be linked into this list, and its neighbours must be alive.
    pub(crate) unsafe fn unlink(&self, cell: &FutexCell) {
        let next = cell.link.next.load(Ordering::Relaxed);
        let prev = cell.prev.load(Ordering::Relaxed);

        unsafe { (*prev).next.store(next, Ordering::Relaxed) };
        compiler_fence(Ordering::SeqCst);

        if next != self.sentinel() {
            unsafe { (*FutexCell::from_node(next)).prev.store(prev, Ordering::Relaxed) };
        }
    }

    /// Number of linked cells. O(n); diagnostics only.
    pub fn size(&self) -> usize {
        self.nodes().count()
    }

    /// Whether `cell` is linked into this list. O(n) in the locks held.
    pub fn contains(&self, cell: &FutexCell) -> bool {
        self.nodes().any(|node| ptr::eq(node, cell))
    }

    /// Log the list at info level.
    pub fn print(&self) {
        log::info!("{self}");
    }

    fn nodes(&self) -> impl Iterator<Item = *const FutexCell> + '_ {
        let sentinel = self.sentinel();
        let mut cur = self.head.list.next.load(Ordering::Relaxed);
        std::iter::from_fn(move || {
            if cur.is_null() || cur == sentinel {
                return None;
            }
            let cell = FutexCell::from_node(cur);
            cur = unsafe { (*cur).next.load(Ordering::Relaxed) };
            Some(cell)
        })
    }
}

impl fmt::Display for RobustList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RobustList ({:p}) ", &self.head)?;
        let mut nodes = self.nodes().peekable();
        if nodes.peek().is_none() {
            return f.write_str("{}");
        }
        f.write_str("{\n")?;
        for cell in nodes {
            // linked cells are held by this thread and outlive the borrow
            writeln!(f, "\t{cell:p}: {:?},", unsafe { &*cell })?;
        }
        f.write_str("}")
    }
}
