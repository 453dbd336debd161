use std::{mem, sync::Arc, thread, time::Duration, time::Instant};

use anyhow::{Result, ensure};
use robust_futex::{RobustList, RobustLock, RobustMutex, RobustSpinlock, SharedMemory, fork_and_wait};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    robust::<RobustSpinlock>("spinlock");
    contended::<RobustSpinlock>("spinlock");
    robust::<RobustMutex>("mutex");
    contended::<RobustMutex>("mutex");
    across_processes()
}

/// Two locks taken by a thread that then exits without unlocking them.
fn robust<L: RobustLock + Default + Send + Sync + 'static>(kind: &str) {
    log::info!("=== {kind}: robust ===");
    let a = Arc::new(L::default());
    let b = Arc::new(L::default());

    thread::spawn({
        let (a, b) = (a.clone(), b.clone());
        move || {
            RobustList::with(RobustList::print);
            mem::forget(a.lock());
            mem::forget(b.lock());
            RobustList::with(RobustList::print);
        }
    })
    .join()
    .expect("locking thread panicked");

    let guard_a = a.lock();
    let guard_b = b.lock();
    RobustList::with(RobustList::print);
    drop(guard_a);
    RobustList::with(RobustList::print);
    drop(guard_b);
    RobustList::with(RobustList::print);
}

/// One thread holds the lock for a second while another waits for it.
fn contended<L: RobustLock + Default + Send + Sync + 'static>(kind: &str) {
    log::info!("=== {kind}: contended ===");
    let lock = Arc::new(L::default());

    let guard = lock.lock();
    let waiter = thread::spawn({
        let lock = lock.clone();
        move || {
            let start = Instant::now();
            let _guard = lock.lock();
            start.elapsed()
        }
    });

    thread::sleep(Duration::from_secs(1));
    drop(guard);
    let waited = waiter.join().expect("waiting thread panicked");
    log::info!("{kind}: waiter blocked for {waited:?}");
}

fn across_processes() -> Result<()> {
    log::info!("=== mutex: across processes ===");
    let mutex = SharedMemory::new(RobustMutex::new())?;

    let status = fork_and_wait(|| mem::forget(mutex.lock()))?;
    log::info!("child holding the mutex exited: {status:?}");
    ensure!(mutex.owner_died(), "kernel did not flag the abandoned mutex");

    let _guard = mutex.lock();
    log::info!("parent recovered the mutex");
    Ok(())
}
