//! Adapts a loop-bound [`Sink`] so another thread can write to it safely
//! (spec §4.D "Sink proxy").
//!
//! The producer side never touches the real sink directly: it clones the
//! buffer's bytes and metadata into a small bounded queue
//! (`crossbeam_channel::bounded`, depth [`DEFAULT_QUEUE_DEPTH`] per spec
//! §4.D's "configurable size, ≤ a small limit, e.g., 16") and wakes the
//! loop with a drain message the first time the queue goes from empty to
//! non-empty. `Buffer` itself is `Rc`-based and therefore not `Send`
//! (spec §5: "cross-thread buffer transfer MUST go through the sink
//! proxy, which clones"), so the queue carries raw bytes and reconstructs
//! a fresh `Buffer` on the loop side.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::{EventLoopHandle, Message};
use crate::buffer::{Buffer, Metadata};
use crate::error::{Error, Result};
use crate::port::{Sink, SinkListener};
use crate::time::Duration;

pub const DEFAULT_QUEUE_DEPTH: usize = 16;

struct QueuedEntry {
    bytes: Vec<u8>,
    metadata: Option<Metadata>,
}

#[derive(Default)]
struct ProducerState {
    listener: Option<Box<dyn SinkListener + Send>>,
    was_blocked: bool,
}

impl ProducerState {
    fn notify_if_unblocked(&mut self, can_put_now: bool) {
        if can_put_now && self.was_blocked {
            self.was_blocked = false;
            if let Some(listener) = self.listener.as_mut() {
                listener.on_can_put();
            }
        }
    }
}

/// `SinkProxyDrain` lives entirely on the loop thread and holds a
/// `Box<dyn Sink>`, which isn't `Send`. The message posted from the
/// producer thread to trigger a drain must still be a `Send` closure, so
/// we wrap the shared drain handle in this newtype and assert `Send` for
/// it: sound because `Message::Call` closures are only ever invoked from
/// inside `EventLoop::run`, on the single thread that thread-guard binds
/// as the loop's own — the `Rc<RefCell<_>>` inside never actually crosses
/// threads, only the pointer to it does, and only a function that will
/// run on the origin thread.
struct LoopCell<T>(Rc<RefCell<T>>);

// SAFETY: see doc comment above — only dereferenced from the loop thread.
unsafe impl<T> Send for LoopCell<T> {}

impl<T> Clone for LoopCell<T> {
    fn clone(&self) -> LoopCell<T> {
        LoopCell(self.0.clone())
    }
}

/// Producer-side handle: implements [`Sink`], safe to hand to any thread.
#[derive(Clone)]
pub struct SinkProxy {
    tx: Sender<QueuedEntry>,
    state: Arc<Mutex<ProducerState>>,
    loop_handle: EventLoopHandle,
    drain: LoopCell<SinkProxyDrain>,
}

impl SinkProxy {
    /// Build a proxy pair: the [`SinkProxy`] to give to the producer
    /// thread, and the [`SinkProxyDrainHandle`] to keep on the loop
    /// thread (e.g. inside the stack element that owns `real_sink`) and
    /// wire as `real_sink`'s own listener via
    /// [`SinkProxyDrainHandle::as_listener`].
    pub fn new(loop_handle: EventLoopHandle, real_sink: Box<dyn Sink>) -> (SinkProxy, SinkProxyDrainHandle) {
        Self::with_capacity(loop_handle, real_sink, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_capacity(
        loop_handle: EventLoopHandle,
        real_sink: Box<dyn Sink>,
        capacity: usize,
    ) -> (SinkProxy, SinkProxyDrainHandle) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let state = Arc::new(Mutex::new(ProducerState::default()));
        let drain = Rc::new(RefCell::new(SinkProxyDrain {
            rx,
            real_sink,
            state: state.clone(),
            pending: None,
        }));

        let drain_cell = LoopCell(drain.clone());
        let listener_cell = LoopCell(drain);
        drain_cell.0.borrow_mut().real_sink.set_listener(Some(Box::new(DrainListener {
            drain: listener_cell,
        })));

        let proxy = SinkProxy {
            tx,
            state,
            loop_handle,
            drain: drain_cell.clone(),
        };
        let handle = SinkProxyDrainHandle { drain: drain_cell };
        (proxy, handle)
    }
}

struct DrainListener {
    drain: LoopCell<SinkProxyDrain>,
}

impl SinkListener for DrainListener {
    fn on_can_put(&mut self) {
        self.drain.0.borrow_mut().drain();
    }
}

impl Sink for SinkProxy {
    /// Clones `buffer`'s bytes and `metadata` into the bounded queue
    /// (spec §4.D: "holds the proxy's mutex briefly to enqueue a cloned
    /// buffer"). Posts a drain message the first time the queue fills
    /// from empty so the loop doesn't poll it needlessly.
    fn put_data(&mut self, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()> {
        let was_empty = self.tx.is_empty();
        let entry = QueuedEntry {
            bytes: buffer.data().to_vec(),
            metadata: metadata.map(|m| m.clone()),
        };
        match self.tx.try_send(entry) {
            Ok(()) => {
                if was_empty {
                    let drain = self.drain.clone();
                    let _ = self.loop_handle.post_message(
                        Message::Call(Box::new(move || {
                            drain.0.borrow_mut().drain();
                        })),
                        Duration::ZERO,
                    );
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.was_blocked = true;
                Err(Error::WouldBlock)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Interrupted),
        }
    }

    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        // `SinkProxy`'s own listener lives on the producer side and must
        // be `Send`; `Sink::set_listener`'s signature isn't, so producers
        // register via `SinkProxy::set_producer_listener` instead. This
        // impl exists only to satisfy the `Sink` trait bound.
        let _ = listener;
    }
}

impl SinkProxy {
    /// Register the listener notified (on the producer thread) once the
    /// real sink has drained enough to accept more. Unlike
    /// [`Sink::set_listener`], this accepts a `Send` listener, matching
    /// spec §4.D: "the proxy emits `on_can_put` to its listener (which
    /// lives on the producer side)".
    pub fn set_producer_listener(&mut self, listener: Option<Box<dyn SinkListener + Send>>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.listener = listener;
    }
}

/// Loop-side handle to the real sink's drain state. Not `Send`; keep it
/// on the loop thread alongside the element that owns the real sink.
pub struct SinkProxyDrainHandle {
    drain: LoopCell<SinkProxyDrain>,
}

impl SinkProxyDrainHandle {
    /// Manually pump the drain (e.g. on startup, before any message has
    /// arrived, to flush anything already queued).
    pub fn drain_now(&self) {
        self.drain.0.borrow_mut().drain();
    }
}

struct SinkProxyDrain {
    rx: Receiver<QueuedEntry>,
    real_sink: Box<dyn Sink>,
    state: Arc<Mutex<ProducerState>>,
    pending: Option<QueuedEntry>,
}

impl SinkProxyDrain {
    /// Walks the queue delivering entries to the real sink until it
    /// blocks or the queue empties (spec §4.D: "if the real sink returns
    /// WOULD_BLOCK, the drain stops and resumes when the proxy is
    /// notified via the real sink's `on_can_put`").
    fn drain(&mut self) {
        loop {
            let entry = match self.pending.take() {
                Some(entry) => entry,
                None => match self.rx.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };
            let buffer = Buffer::copy_from_slice(&entry.bytes);
            let metadata = entry.metadata.clone();
            match self.real_sink.put_data(buffer, metadata.as_ref()) {
                Ok(()) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.notify_if_unblocked(true);
                }
                Err(Error::WouldBlock) => {
                    self.pending = Some(entry);
                    break;
                }
                Err(_) => {
                    // Malformed or rejected entry: drop it and keep
                    // draining the rest of the queue.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CapturingSink {
        capacity: usize,
        received: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Sink for CapturingSink {
        fn put_data(&mut self, buffer: Buffer, _metadata: Option<&Metadata>) -> Result<()> {
            let mut received = self.received.borrow_mut();
            if received.len() >= self.capacity {
                return Err(Error::WouldBlock);
            }
            received.push(buffer.data().to_vec());
            Ok(())
        }

        fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {}
    }

    #[test]
    fn drain_stops_on_would_block_and_resumes_when_unblocked() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = CapturingSink {
            capacity: 1,
            received: received.clone(),
        };
        let (tx, rx) = crossbeam_channel::bounded(4);
        let state = Arc::new(Mutex::new(ProducerState::default()));
        let mut drain = SinkProxyDrain {
            rx,
            real_sink: Box::new(sink),
            state,
            pending: None,
        };

        tx.send(QueuedEntry { bytes: vec![1], metadata: None }).unwrap();
        tx.send(QueuedEntry { bytes: vec![2], metadata: None }).unwrap();

        drain.drain();
        assert_eq!(*received.borrow(), vec![vec![1]]);

        drain.real_sink = Box::new(CapturingSink {
            capacity: 4,
            received: received.clone(),
        });
        drain.drain();
        assert_eq!(*received.borrow(), vec![vec![1], vec![2]]);
    }
}
