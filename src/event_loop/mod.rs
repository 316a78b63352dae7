//! Single-threaded cooperative event loop (spec §4.D).
//!
//! All core Golden Gate objects — timers, the Gattlink session, the frame
//! assembler, the DTLS element, the stack itself — are bound to exactly
//! one `EventLoop`. This mirrors `tapip_rs::phy::Device`'s single-owner
//! polling model one level up: instead of one thread polling one NIC, one
//! thread here polls a message queue plus an arbitrary number of
//! registered file descriptors, enriched with `mio::Poll`/`mio::Waker`
//! (the same reactor crate `other_examples/manifests/vectordotdev-vector`,
//! `.../gattaca-com-flux` and `.../paritytech-polkadot-sdk` all pull in for
//! this exact single-threaded-reactor role) and `crossbeam_channel` for the
//! cross-thread FIFO (grounded on `carvalhof-bkp1`/demikernel's use of the
//! same crate as its cross-thread handoff primitive).

pub mod listener_proxy;
pub mod message;
pub mod sink_proxy;
mod thread_guard;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, SendTimeoutError, TrySendError};
use mio::{Events, Interest, Poll, Token, Waker};

pub use message::Message;
pub use thread_guard::ThreadGuard;

use crate::error::{Error, Result};
use crate::time::{Duration, Instant};
use crate::timer::Scheduler;

const WAKE_TOKEN: Token = Token(usize::MAX);
const DEFAULT_MESSAGE_QUEUE_DEPTH: usize = 64;

/// Reacts to readiness on a file descriptor registered with
/// [`EventLoop::register_io`]. Implemented by stack elements that own raw
/// sockets (the netif element's TAP device, the datagram socket element's
/// UDP socket).
pub trait IoHandler {
    fn on_ready(&mut self, readable: bool, writable: bool);
}

/// A cheap, `Send + Clone` handle to a running [`EventLoop`]. This, not
/// the loop itself, is what [`sink_proxy::SinkProxy`],
/// [`listener_proxy::ListenerProxy`] and external callers hold — the
/// `EventLoop` never leaves the thread that calls [`EventLoop::run`].
#[derive(Clone)]
pub struct EventLoopHandle {
    messages_tx: Sender<Message>,
    waker: Arc<Waker>,
    invoke_lock: Arc<Mutex<()>>,
    thread_guard: Arc<ThreadGuard>,
}

impl EventLoopHandle {
    /// Post `msg` to the loop's FIFO (spec §4.D). `timeout` bounds how
    /// long to wait for a free slot when the queue is momentarily full;
    /// `Duration::ZERO` tries once without waiting.
    pub fn post_message(&self, msg: Message, timeout: Duration) -> Result<()> {
        let send_result = if timeout == Duration::ZERO {
            self.messages_tx.try_send(msg).map_err(|e| match e {
                TrySendError::Full(_) => Error::Timeout,
                TrySendError::Disconnected(_) => Error::Interrupted,
            })
        } else {
            self.messages_tx
                .send_timeout(msg, timeout.into())
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => Error::Timeout,
                    SendTimeoutError::Disconnected(_) => Error::Interrupted,
                })
        };
        send_result?;
        // A wake() failure here means the loop's Poll has already been
        // dropped (post-termination); the message is queued regardless
        // and simply never drained, which is fine at shutdown.
        let _ = self.waker.wake();
        Ok(())
    }

    /// Run `f` on the loop thread and return its result (spec §4.D
    /// `invoke_sync`). If the calling thread already *is* the loop
    /// thread, `f` runs inline. Otherwise a per-loop mutex serializes
    /// concurrent cross-thread callers and the caller blocks on a
    /// rendezvous channel that the loop's execution of `f` feeds —
    /// the channel rendezvous *is* the semaphore spec §4.D describes.
    pub fn invoke_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.thread_guard.is_loop_thread() {
            return f();
        }
        let _serialize = self.invoke_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (result_tx, result_rx) = crossbeam_channel::bounded::<R>(0);
        let mut f = Some(f);
        let msg = Message::Call(Box::new(move || {
            if let Some(f) = f.take() {
                let _ = result_tx.send(f());
            }
        }));
        self.messages_tx
            .send(msg)
            .expect("invoke_sync: event loop's message queue is gone");
        let _ = self.waker.wake();
        result_rx
            .recv()
            .expect("invoke_sync: loop dropped the result channel without replying")
    }

    /// Post `f` to run on the loop thread without waiting for it (spec
    /// §4.D `invoke_async`: "allocates a self-freeing message, posts it,
    /// returns immediately" — the closure's `Box` is our single-shot
    /// allocation, freed by `Drop` once dispatched).
    pub fn invoke_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        let msg = Message::Call(Box::new(move || {
            if let Some(f) = f.take() {
                f();
            }
        }));
        self.post_message(msg, Duration::ZERO)
    }

    /// A message that sets the loop's terminate flag when dispatched.
    /// Safe to post from any thread.
    pub fn termination_message(&self) -> Message {
        Message::Terminate
    }
}

/// The loop itself. Construct on the thread that will call [`run`](EventLoop::run);
/// clone a handle with [`handle`](EventLoop::handle) before handing it to
/// other threads.
pub struct EventLoop {
    poll: Poll,
    waker: Arc<Waker>,
    messages_tx: Sender<Message>,
    messages_rx: Receiver<Message>,
    invoke_lock: Arc<Mutex<()>>,
    thread_guard: Arc<ThreadGuard>,
    timers: Rc<RefCell<Scheduler>>,
    io_handlers: HashMap<Token, Box<dyn IoHandler>>,
    next_token: usize,
    terminated: bool,
}

impl EventLoop {
    pub fn new(timer_pool_size: usize) -> std::io::Result<EventLoop> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (messages_tx, messages_rx) = crossbeam_channel::bounded(DEFAULT_MESSAGE_QUEUE_DEPTH);
        Ok(EventLoop {
            poll,
            waker,
            messages_tx,
            messages_rx,
            invoke_lock: Arc::new(Mutex::new(())),
            thread_guard: Arc::new(ThreadGuard::new()),
            timers: Rc::new(RefCell::new(Scheduler::new(timer_pool_size))),
            io_handlers: HashMap::new(),
            next_token: 0,
            terminated: false,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            messages_tx: self.messages_tx.clone(),
            waker: self.waker.clone(),
            invoke_lock: self.invoke_lock.clone(),
            thread_guard: self.thread_guard.clone(),
        }
    }

    /// A loop-thread-only, shared handle to the timer pool. Stack
    /// elements hold a clone of this (never sent across threads) so they
    /// can create/schedule/unschedule their own timers without the
    /// `EventLoop` itself needing to know about every element.
    pub fn timers(&self) -> Rc<RefCell<Scheduler>> {
        self.timers.clone()
    }

    /// Register a raw I/O source for readiness notification. Returns a
    /// token to pass to [`deregister_io`](EventLoop::deregister_io).
    pub fn register_io<S: mio::event::Source>(
        &mut self,
        source: &mut S,
        interest: Interest,
        handler: Box<dyn IoHandler>,
    ) -> std::io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        self.io_handlers.insert(token, handler);
        Ok(token)
    }

    pub fn deregister_io<S: mio::event::Source>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> std::io::Result<()> {
        self.poll.registry().deregister(source)?;
        self.io_handlers.remove(&token);
        Ok(())
    }

    /// Runs until a [`Message::Terminate`] is dispatched (spec §4.D
    /// `run()`). Binds the calling thread as this loop's thread of record.
    /// Each due timer's own registered listener (spec §4.C `schedule`) is
    /// notified directly by the scheduler; `run` itself doesn't need to
    /// know which element owns which timer.
    pub fn run(&mut self) -> Result<()> {
        self.thread_guard.bind();
        let mut events = Events::with_capacity(128);

        while !self.terminated {
            let now = Instant::now();
            let wait = self
                .timers
                .borrow()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now).into());

            match self.poll.poll(&mut events, wait) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("event loop poll failed: {e}");
                }
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                if let Some(handler) = self.io_handlers.get_mut(&event.token()) {
                    handler.on_ready(event.is_readable(), event.is_writable());
                }
            }

            let now = Instant::now();
            self.timers.borrow_mut().set_time(now);

            while let Ok(mut msg) = self.messages_rx.try_recv() {
                if msg.dispatch() {
                    self.terminated = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[test]
    fn invoke_async_runs_on_the_loop_thread() {
        let mut event_loop = EventLoop::new(4).unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let terminate = event_loop.handle();

        let worker = std::thread::spawn(move || {
            std::thread::sleep(StdDuration::from_millis(20));
            handle.invoke_async(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
            terminate
                .post_message(terminate.termination_message(), Duration::from_secs(1))
                .unwrap();
        });

        event_loop.run().unwrap();
        worker.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_sync_blocks_until_the_loop_runs_it() {
        let mut event_loop = EventLoop::new(4).unwrap();
        let handle = event_loop.handle();
        let terminate = event_loop.handle();

        let worker = std::thread::spawn(move || {
            let doubled = handle.invoke_sync(|| 21 * 2);
            assert_eq!(doubled, 42);
            terminate
                .post_message(terminate.termination_message(), Duration::from_secs(1))
                .unwrap();
        });

        event_loop.run().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn timers_fire_during_run() {
        use crate::timer::TimerListener;
        use std::cell::RefCell;

        struct CountingListener(Arc<AtomicUsize>);
        impl TimerListener for CountingListener {
            fn on_timer_fired(&mut self, _timer: crate::timer::TimerHandle, _elapsed: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut event_loop = EventLoop::new(4).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let timers = event_loop.timers();
        let timer = timers.borrow_mut().create_timer().unwrap();
        let listener = Rc::new(RefCell::new(CountingListener(fired.clone())));
        timers
            .borrow_mut()
            .schedule(timer, listener, Instant::now(), 10);

        let handle = event_loop.handle();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(StdDuration::from_millis(100));
            handle
                .post_message(handle.termination_message(), Duration::from_secs(1))
                .unwrap();
        });

        event_loop.run().unwrap();
        worker.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
