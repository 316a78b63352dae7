//! Cross-thread message envelopes posted onto the event loop's FIFO
//! (spec §4.D).
//!
//! `tapip_rs` has no analogue — it's single-process, single-thread by
//! construction — so this shape is grounded directly on spec §4.D's
//! "handle then release" two-phase message, realized here as an enum
//! dispatched once and then dropped rather than a `handle`/`release`
//! trait pair, since Rust's `Drop` already gives us "release" for free.

/// A unit of work posted to the loop from any thread.
pub enum Message {
    /// Sets the loop's terminate flag. Safe to post from any thread
    /// (spec §4.D: "a preallocated message whose `handle` sets the
    /// terminate flag").
    Terminate,
    /// Runs an arbitrary closure on the loop thread, then drops it.
    Call(Box<dyn FnMut() + Send + 'static>),
}

impl Message {
    /// Dispatches this message. Returns `true` if it requested
    /// termination.
    pub(crate) fn dispatch(&mut self) -> bool {
        match self {
            Message::Terminate => true,
            Message::Call(f) => {
                f();
                false
            }
        }
    }
}
