//! Scoped blocking of a UNIX signal.
//!
//! Some collective libraries allocate shared memory during communicator
//! initialization and fail on `EINTR`. Profilers deliver `SIGPROF` often enough
//! to hit that window, so the signal is blocked for the duration of the
//! initialization. Which mask matters depends on the library's threads, so both
//! the calling thread's mask and the process mask are set.
//!
//! On targets without UNIX signal masks the guard does nothing.

/// Which signal mask a guard modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskScope {
    /// `pthread_sigmask` on the calling thread.
    Thread,
    /// `sigprocmask` on the process.
    Process,
}

/// Blocks one signal until dropped, then restores the previous mask exactly.
pub struct BlockSignal {
    #[cfg(unix)]
    old: libc::sigset_t,
    #[cfg(unix)]
    scope: MaskScope,
    #[cfg(unix)]
    active: bool,
}

#[cfg(unix)]
impl BlockSignal {
    pub fn new(signal: i32, scope: MaskScope) -> Self {
        unsafe {
            let mut new: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut new);
            libc::sigaddset(&mut new, signal);
            let rc = set_mask(scope, libc::SIG_BLOCK, &new, &mut old);
            if rc != 0 {
                tracing::warn!(signal, ?scope, "failed to block signal (rc={rc})");
            }
            Self {
                old,
                scope,
                active: rc == 0,
            }
        }
    }
}

#[cfg(unix)]
unsafe fn set_mask(
    scope: MaskScope,
    how: libc::c_int,
    set: *const libc::sigset_t,
    old: *mut libc::sigset_t,
) -> libc::c_int {
    unsafe {
        match scope {
            MaskScope::Thread => libc::pthread_sigmask(how, set, old),
            MaskScope::Process => libc::sigprocmask(how, set, old),
        }
    }
}

#[cfg(unix)]
impl Drop for BlockSignal {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let rc = unsafe { set_mask(self.scope, libc::SIG_SETMASK, &self.old, std::ptr::null_mut()) };
        if rc != 0 {
            tracing::warn!(scope = ?self.scope, "failed to restore signal mask (rc={rc})");
        }
    }
}

#[cfg(not(unix))]
impl BlockSignal {
    pub fn new(_signal: i32, _scope: MaskScope) -> Self {
        Self {}
    }
}

/// Block `signal` on both the thread and the process mask, if given.
pub(crate) fn block_both(signal: Option<i32>) -> Option<(BlockSignal, BlockSignal)> {
    signal.map(|sig| {
        let thread = BlockSignal::new(sig, MaskScope::Thread);
        let process = BlockSignal::new(sig, MaskScope::Process);
        // tuple fields drop first to last: undo in reverse order of blocking
        (process, thread)
    })
}
