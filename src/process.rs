use std::panic::{self, AssertUnwindSafe};

use anyhow::{Context, Result};
use nix::{
    sys::wait::{WaitStatus, waitpid},
    unistd::{ForkResult, fork},
};

/// Run `f` in a forked child and wait for the child to exit.
///
/// The child leaves through `_exit`: no destructors, no atexit handlers, and
/// whatever locks `f` still holds are left for the kernel to mark as
/// owner-died. A panic in `f` exits the child with status 101.
pub fn fork_and_wait(f: impl FnOnce()) -> Result<WaitStatus> {
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => 0,
                Err(_) => 101,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            log::debug!("forked child {child}");
            waitpid(child, None).with_context(|| format!("waitpid({child}) failed"))
        }
    }
}
