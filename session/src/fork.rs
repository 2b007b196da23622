//! Fork detection for the session.
//!
//! Two independent signals feed one sticky flag:
//!
//! - a lazy check comparing the pid that last touched the session with the
//!   current one, which catches children created by raw `clone`/`fork`
//!   syscalls that never run `pthread_atfork` handlers;
//! - eager hooks run by the C library around `fork()`, which mark the child
//!   before any of its code can reach the stale device handle.
//!
//! Hosts without a duplication hook facility use [`NoForkHooks`]; the child
//! is then only noticed on its next open or close.

use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::OnceLock;
use std::sync::Weak;

use crate::lock::ForkSafeMutex;

/// Source of the current process identity.
pub trait ProcessIdentity: Send + Sync {
    fn current_pid(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcess;

impl ProcessIdentity for OsProcess {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// Callbacks run around process duplication.
pub trait ForkHandlers: Send + Sync {
    /// Runs in the parent right before duplication.
    fn prepare(&self);
    /// Runs in the parent once the child exists.
    fn parent(&self);
    /// Runs in the child, which has exactly one thread at this point.
    fn child(&self);
}

/// A facility that runs registered [`ForkHandlers`] around process
/// duplication.
///
/// Handlers are held weakly: once their owner is dropped they are skipped
/// and eventually pruned. Callers must not hold a lock that a `prepare`
/// handler takes while registering.
pub trait ForkHookRegistry: Send + Sync {
    fn register(&self, handlers: Weak<dyn ForkHandlers>) -> io::Result<()>;
}

/// Lazy pid-comparison state plus the sticky "forked" flag.
///
/// Any fork signal sets the flag and only [`ForkDetector::reset`] clears it.
#[derive(Debug, Default)]
pub(crate) struct ForkDetector {
    owning_pid: Option<u32>,
    forked: bool,
}

impl ForkDetector {
    pub(crate) fn detect(&mut self, current_pid: u32) -> bool {
        if self.forked {
            return true;
        }
        match self.owning_pid {
            None => {
                self.owning_pid = Some(current_pid);
                false
            }
            Some(pid) if pid != current_pid => {
                self.forked = true;
                true
            }
            Some(_) => false,
        }
    }

    pub(crate) fn mark_forked(&mut self) {
        self.forked = true;
    }

    pub(crate) fn reset(&mut self) {
        self.owning_pid = None;
        self.forked = false;
    }

    pub(crate) fn owning_pid(&self) -> Option<u32> {
        self.owning_pid
    }
}

/// `pthread_atfork`-backed registry shared by the whole process.
///
/// The C hooks are installed once and walk [`HandlerList`]. The list lock is
/// taken before any handler's `prepare`, so it must never be requested while
/// a session lock is held.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtFork;

static HANDLERS: LazyLock<HandlerList> = LazyLock::new(HandlerList::default);
static INSTALL_RESULT: OnceLock<libc::c_int> = OnceLock::new();

impl ForkHookRegistry for AtFork {
    fn register(&self, handlers: Weak<dyn ForkHandlers>) -> io::Result<()> {
        // Built before the hooks exist so they never run its initializer.
        let list = &*HANDLERS;
        let rc = *INSTALL_RESULT.get_or_init(|| unsafe {
            libc::pthread_atfork(
                Some(prepare_fork_handler),
                Some(parent_fork_handler),
                Some(child_fork_handler),
            )
        });
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        list.register(handlers);
        Ok(())
    }
}

unsafe extern "C" fn prepare_fork_handler() {
    HANDLERS.prepare();
}

unsafe extern "C" fn parent_fork_handler() {
    HANDLERS.parent();
}

unsafe extern "C" fn child_fork_handler() {
    HANDLERS.child();
}

#[derive(Default)]
struct HandlerListState {
    registered: Vec<Weak<dyn ForkHandlers>>,
    /// Handlers upgraded by `prepare`, kept alive until the matching
    /// `parent` or `child` phase has run.
    in_flight: Vec<Arc<dyn ForkHandlers>>,
}

/// Weakly held handlers driven through the three fork phases.
///
/// The list lock is held from `prepare` until `parent` (or rebuilt by
/// `child`), so the set of handlers cannot change in the middle of a fork.
#[derive(Debug, Default)]
pub(crate) struct HandlerList {
    state: ForkSafeMutex<HandlerListState>,
}

impl HandlerList {
    pub(crate) fn register(&self, handlers: Weak<dyn ForkHandlers>) {
        let mut state = self.state.lock();
        state.registered.retain(|handlers| handlers.strong_count() > 0);
        state.registered.push(handlers);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().registered.len()
    }

    pub(crate) fn prepare(&self) {
        // SAFETY: released by `parent` in this thread, or rebuilt by `child`
        // in the duplicate.
        unsafe { self.state.lock_raw() };
        // SAFETY: the lock is held.
        let state = unsafe { self.state.data_mut() };
        state.registered.retain(|handlers| handlers.strong_count() > 0);
        let live: Vec<_> = state.registered.iter().filter_map(Weak::upgrade).collect();
        state.in_flight = live;
        for handlers in &state.in_flight {
            handlers.prepare();
        }
    }

    pub(crate) fn parent(&self) {
        // SAFETY: `prepare` took the lock in this thread.
        let state = unsafe { self.state.data_mut() };
        let in_flight = mem::take(&mut state.in_flight);
        for handlers in &in_flight {
            handlers.parent();
        }
        // SAFETY: as above.
        unsafe { self.state.unlock_raw() };
    }

    pub(crate) fn child(&self) {
        // SAFETY: the child has a single thread; the lock is marked as held
        // by the thread that forked.
        unsafe { self.state.reinit() };
        let in_flight = mem::take(&mut self.state.lock().in_flight);
        for handlers in &in_flight {
            handlers.child();
        }
    }
}

/// Registry for hosts without a duplication hook facility.
///
/// Registration succeeds and does nothing. Forks are then only observed by
/// pid comparison on the next open or close.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForkHooks;

impl ForkHookRegistry for NoForkHooks {
    fn register(&self, _handlers: Weak<dyn ForkHandlers>) -> io::Result<()> {
        tracing::debug!("no fork hook facility; relying on pid comparison");
        Ok(())
    }
}
