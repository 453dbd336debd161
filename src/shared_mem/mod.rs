use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::Deref,
    process,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};

use shmlink::SharedMem;

mod shmlink;

const PAGE_SIZE: usize = 4096;

/// A `T` living in memory shared with every process forked after it was
/// created, e.g. a lock used by a parent and its children.
pub struct SharedMemory<T> {
    shmem: SharedMem,
    _holds: PhantomData<T>,
}

unsafe impl<T: Sync> Send for SharedMemory<T> {}
unsafe impl<T: Sync> Sync for SharedMemory<T> {}

impl<T: Sync> SharedMemory<T> {
    pub fn new(value: T) -> Result<Self> {
        const {
            assert!(align_of::<T>() <= PAGE_SIZE);
        }
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let name = format!(
            "robust_futex.{}.{}",
            process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let shmem = SharedMem::new(&name, size_of::<T>().max(1))
            .with_context(|| format!("Failed to create shared memory {name}"))?;

        // fresh page-aligned mapping, nothing to drop
        unsafe { ptr::write(shmem.as_ptr().cast::<T>(), value) };

        Ok(Self {
            shmem,
            _holds: PhantomData,
        })
    }
}

impl<T> Deref for SharedMemory<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.shmem.as_ptr().cast::<T>() }
    }
}

impl<T> Drop for SharedMemory<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.shmem.as_ptr().cast::<T>()) };
    }
}
