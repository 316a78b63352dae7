//! Uniform data-flow contracts: sinks, sources and listeners (spec §4.B).
//!
//! Mirrors the way `tapip_rs::phy` expresses a uniform contract
//! (`Device`/`RxToken`/`TxToken`) that every concrete transport implements,
//! except here the flow is push-based (producer calls `put_data`) rather
//! than token-based, because stack elements push data downstream/upstream
//! as it becomes available rather than being polled.

use crate::buffer::{Buffer, Metadata};
use crate::error::{Error, Result};

/// Receives data pushed from upstream or downstream.
///
/// # Back-pressure contract (spec §4.B)
///
/// Implementations MUST return [`Error::WouldBlock`] without buffering
/// when they cannot accept `buffer` right now — never block, never queue
/// internally beyond what the implementation's own stated capacity
/// allows. Callers MUST NOT immediately retry after `WouldBlock`; they
/// must wait for [`SinkListener::on_can_put`]. A sink MUST call
/// `on_can_put` on its registered listener exactly once per transition
/// into a state where a subsequent `put_data` might succeed — not once
/// per unblocked byte, and never speculatively while still blocked.
///
/// `metadata`, when present, is borrowed for the duration of the call;
/// a sink that needs it past return MUST call
/// [`Metadata::clone_metadata`].
pub trait Sink {
    fn put_data(&mut self, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()>;

    /// Register the listener notified via [`SinkListener::on_can_put`]
    /// once this sink can accept data again after returning `WouldBlock`.
    /// Replaces any previously registered listener.
    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>);
}

/// Emits data to a single registered [`Sink`].
///
/// Registering a new sink replaces any previously registered one; there
/// is exactly one sink per source, matching the one-edge-at-a-time
/// wiring `stack::Stack` performs when composing elements vertically.
pub trait Source {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>);
}

/// Notified when a sink that previously returned `WouldBlock` can accept
/// data again.
pub trait SinkListener {
    fn on_can_put(&mut self);
}

/// Helper for sink implementations: a single `Option<listener>` slot plus
/// the "fire at most once per edge transition" bookkeeping spec §4.B
/// requires. Each concrete sink (Gattlink, the frame assembler, a sink
/// proxy, ...) owns one of these rather than reimplementing the same
/// three lines.
#[derive(Default)]
pub struct ListenerSlot {
    listener: Option<Box<dyn SinkListener>>,
    was_blocked: bool,
}

impl ListenerSlot {
    pub fn set(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.listener = listener;
    }

    /// Record that `put_data` just returned `WouldBlock`.
    pub fn note_blocked(&mut self) {
        self.was_blocked = true;
    }

    /// Called whenever the implementation re-checks its own readiness
    /// (e.g. after freeing window space). Fires `on_can_put` exactly once
    /// per block/unblock edge.
    pub fn notify_if_unblocked(&mut self, can_put_now: bool) {
        if can_put_now && self.was_blocked {
            self.was_blocked = false;
            if let Some(listener) = self.listener.as_mut() {
                listener.on_can_put();
            }
        }
    }
}

impl std::fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("has_listener", &self.listener.is_some())
            .field("was_blocked", &self.was_blocked)
            .finish()
    }
}

/// Convenience: turn an `Option<()>`-shaped capacity check into the
/// spec's `WouldBlock`-or-proceed contract.
pub fn would_block_unless(ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::WouldBlock)
    }
}
