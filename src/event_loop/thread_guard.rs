//! Debug-only binding of loop-affine entry points to the thread that runs
//! them (spec §5: "all core objects are bound to [the event loop]";
//! addition grounded on that ask plus `tapip_rs`'s habit of gating
//! expensive correctness checks behind `debug_assert!`/`#[allow(unused)]`
//! rather than paying for them in release builds).

use std::sync::OnceLock;
use std::thread::{self, ThreadId};

pub struct ThreadGuard {
    owner: OnceLock<ThreadId>,
}

impl ThreadGuard {
    pub const fn new() -> ThreadGuard {
        ThreadGuard {
            owner: OnceLock::new(),
        }
    }

    /// Record the calling thread as the loop's thread of record. A no-op
    /// if already bound (e.g. `run()` called more than once).
    pub fn bind(&self) {
        let _ = self.owner.set(thread::current().id());
    }

    /// True if the loop hasn't bound a thread yet, or the calling thread
    /// *is* the bound thread.
    pub fn is_loop_thread(&self) -> bool {
        self.owner
            .get()
            .map_or(true, |owner| *owner == thread::current().id())
    }

    /// Debug-assert that the caller is on the loop thread. Compiled out
    /// in release builds.
    pub fn check(&self) {
        debug_assert!(self.is_loop_thread(), "called off the event loop thread");
    }
}

impl Default for ThreadGuard {
    fn default() -> ThreadGuard {
        ThreadGuard::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_guard_accepts_any_thread() {
        let guard = ThreadGuard::new();
        assert!(guard.is_loop_thread());
    }

    #[test]
    fn bound_guard_accepts_the_binding_thread() {
        let guard = ThreadGuard::new();
        guard.bind();
        assert!(guard.is_loop_thread());
    }

    #[test]
    fn bound_guard_rejects_other_threads() {
        let guard = std::sync::Arc::new(ThreadGuard::new());
        guard.bind();
        let other = std::sync::Arc::clone(&guard);
        let rejected = std::thread::spawn(move || !other.is_loop_thread())
            .join()
            .unwrap();
        assert!(rejected);
    }
}
