//! Wires [`Session`] into the stack's [`Sink`]/[`Source`] ports and a real
//! [`Scheduler`], the way `stack::Stack` expects every element to present
//! itself: a top port (plaintext byte stream, towards the application) and
//! a bottom port (opaque packets, towards the transport).
//!
//! The `Rc<RefCell<Core>>` + small facade-handle pattern here is the same
//! shape [`crate::event_loop::sink_proxy`] uses to let several independent
//! handles reach one shared, loop-affine piece of state.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::port::{ListenerSlot, Sink, SinkListener, Source};
use crate::time::Instant;
use crate::timer::{Scheduler, TimerHandle, TimerListener};

use super::{GattlinkTimer, Session, SessionConfig, SessionEvent, SessionHost};

const DELAYED_ACK: usize = 0;
const RESET: usize = 1;
const RETRANSMIT: usize = 2;

fn timer_index(timer: GattlinkTimer) -> usize {
    match timer {
        GattlinkTimer::DelayedAck => DELAYED_ACK,
        GattlinkTimer::Reset => RESET,
        GattlinkTimer::Retransmit => RETRANSMIT,
    }
}

/// Non-session state [`Session`] drives through the [`SessionHost`] seam:
/// port wiring, the timer pool handle and pending-delivery bookkeeping.
/// Kept as a field separate from `Session` so `Core::on_timer_fired` can
/// borrow `session` and `host` independently when calling
/// `session.on_timer_fired(timer, elapsed, &mut self.host)`.
struct HostState {
    self_weak: Weak<RefCell<Core>>,
    timers: Rc<RefCell<Scheduler>>,
    timer_handles: [Option<TimerHandle>; 3],
    timer_listeners: [Rc<RefCell<dyn TimerListener>>; 3],

    upper_sink: Option<Box<dyn Sink>>,
    /// Registered by `TopSink::set_listener`; outbound is currently
    /// unbounded (see `Session::write_outbound`) so this is never fired.
    upper_listener: ListenerSlot,
    pending_deliver: std::collections::VecDeque<Vec<u8>>,

    lower_sink: Option<Box<dyn Sink>>,

    event_listener: Option<Box<dyn FnMut(SessionEvent)>>,
}

const MAX_PENDING_DELIVER: usize = 64;

impl HostState {
    fn drain_pending(&mut self) {
        while let Some(front) = self.pending_deliver.front() {
            let Some(sink) = self.upper_sink.as_mut() else {
                break;
            };
            let buf = Buffer::copy_from_slice(front);
            match sink.put_data(buf, None) {
                Ok(()) => {
                    self.pending_deliver.pop_front();
                }
                Err(Error::WouldBlock) => break,
                Err(e) => {
                    log::warn!("gattlink: upper sink rejected delivered data: {e}");
                    self.pending_deliver.pop_front();
                }
            }
        }
    }

    fn register_upper_listener(&mut self) {
        let weak = self.self_weak.clone();
        if let Some(sink) = self.upper_sink.as_mut() {
            sink.set_listener(Some(Box::new(UpperDrainListener { core: weak })));
        }
    }
}

impl SessionHost for HostState {
    fn send_packet(&mut self, data: &[u8]) -> Result<()> {
        match self.lower_sink.as_mut() {
            Some(sink) => {
                let buf = Buffer::copy_from_slice(data);
                sink.put_data(buf, None)
            }
            None => Err(Error::NotSupported),
        }
    }

    fn deliver_data(&mut self, data: &[u8]) {
        if self.pending_deliver.len() >= MAX_PENDING_DELIVER {
            log::warn!("gattlink: pending-delivery queue full, dropping reassembled data");
            return;
        }
        self.pending_deliver.push_back(data.to_vec());
        self.drain_pending();
    }

    fn arm_timer(&mut self, timer: GattlinkTimer, ms: u64) {
        let idx = timer_index(timer);
        let handle = match self.timer_handles[idx] {
            Some(h) => h,
            None => match self.timers.borrow_mut().create_timer() {
                Ok(h) => {
                    self.timer_handles[idx] = Some(h);
                    h
                }
                Err(e) => {
                    log::error!("gattlink: could not arm timer, pool exhausted: {e}");
                    return;
                }
            },
        };
        self.timers
            .borrow_mut()
            .schedule(handle, self.timer_listeners[idx].clone(), Instant::now(), ms);
    }

    fn disarm_timer(&mut self, timer: GattlinkTimer) {
        let idx = timer_index(timer);
        if let Some(handle) = self.timer_handles[idx] {
            self.timers.borrow_mut().unschedule(handle);
        }
    }

    fn emit_event(&mut self, event: SessionEvent) {
        if let Some(listener) = self.event_listener.as_mut() {
            listener(event);
        }
    }
}

struct Core {
    session: Session,
    host: HostState,
}

impl Core {
    fn on_timer_fired(&mut self, timer: GattlinkTimer, elapsed: crate::time::Duration) {
        self.session.on_timer_fired(timer, elapsed, &mut self.host);
    }
}

struct TimerBridge {
    core: Weak<RefCell<Core>>,
    which: GattlinkTimer,
}

impl TimerListener for TimerBridge {
    fn on_timer_fired(&mut self, _handle: TimerHandle, elapsed: crate::time::Duration) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().on_timer_fired(self.which, elapsed);
        }
    }
}

struct UpperDrainListener {
    core: Weak<RefCell<Core>>,
}

impl SinkListener for UpperDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().host.drain_pending();
        }
    }
}

/// The Gattlink stack element: a [`Session`] bound to real ports and a
/// real timer scheduler. Cheap to clone (all handles share one `Core`).
#[derive(Clone)]
pub struct GattlinkElement {
    core: Rc<RefCell<Core>>,
}

impl GattlinkElement {
    pub fn new(config: SessionConfig, timers: Rc<RefCell<Scheduler>>) -> GattlinkElement {
        let core = Rc::new_cyclic(|weak: &Weak<RefCell<Core>>| {
            let timer_listeners: [Rc<RefCell<dyn TimerListener>>; 3] = [
                Rc::new(RefCell::new(TimerBridge {
                    core: weak.clone(),
                    which: GattlinkTimer::DelayedAck,
                })),
                Rc::new(RefCell::new(TimerBridge {
                    core: weak.clone(),
                    which: GattlinkTimer::Reset,
                })),
                Rc::new(RefCell::new(TimerBridge {
                    core: weak.clone(),
                    which: GattlinkTimer::Retransmit,
                })),
            ];
            RefCell::new(Core {
                session: Session::new(config),
                host: HostState {
                    self_weak: weak.clone(),
                    timers,
                    timer_handles: [None, None, None],
                    timer_listeners,
                    upper_sink: None,
                    upper_listener: ListenerSlot::default(),
                    pending_deliver: std::collections::VecDeque::new(),
                    lower_sink: None,
                    event_listener: None,
                },
            })
        });
        GattlinkElement { core }
    }

    pub fn start(&self) {
        let mut core = self.core.borrow_mut();
        let Core { session, host } = &mut *core;
        session.start(host);
    }

    pub fn reset(&self) {
        let mut core = self.core.borrow_mut();
        let Core { session, host } = &mut *core;
        session.reset(host);
    }

    pub fn state(&self) -> super::SessionState {
        self.core.borrow().session.state()
    }

    pub fn set_event_listener(&self, f: impl FnMut(SessionEvent) + 'static) {
        self.core.borrow_mut().host.event_listener = Some(Box::new(f));
    }

    /// Adjusts the max transport fragment size, routed here by the stack
    /// when the underlying link's MTU changes (spec §4.H).
    pub fn set_max_transport_fragment_size(&self, size: usize) {
        self.core.borrow_mut().session.set_max_packet_size(size);
    }

    pub fn top_sink(&self) -> TopSink {
        TopSink { core: self.core.clone() }
    }

    pub fn top_source(&self) -> TopSource {
        TopSource { core: self.core.clone() }
    }

    pub fn bottom_sink(&self) -> BottomSink {
        BottomSink { core: self.core.clone() }
    }

    pub fn bottom_source(&self) -> BottomSource {
        BottomSource { core: self.core.clone() }
    }
}

/// Accepts application bytes to be sent over Gattlink.
pub struct TopSink {
    core: Rc<RefCell<Core>>,
}

impl Sink for TopSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&crate::buffer::Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        let Core { session, host } = &mut *core;
        session.write_outbound(&data, host)
    }

    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().host.upper_listener.set(listener);
    }
}

/// Registers the sink that receives Gattlink's reassembled application
/// bytes (towards the app).
pub struct TopSource {
    core: Rc<RefCell<Core>>,
}

impl Source for TopSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        let mut core = self.core.borrow_mut();
        core.host.upper_sink = sink;
        core.host.register_upper_listener();
    }
}

/// Accepts raw packets arriving from the transport.
pub struct BottomSink {
    core: Rc<RefCell<Core>>,
}

impl Sink for BottomSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&crate::buffer::Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        let bytes: Vec<u8> = data.to_vec();
        drop(data);
        let Core { session, host } = &mut *core;
        session.on_packet_received(&bytes, host)
    }

    fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {
        // Raw-packet ingestion is processed synchronously; there is
        // nothing to buffer against, so this port never blocks.
    }
}

/// Registers the sink that receives Gattlink's outgoing raw packets
/// (towards the transport).
pub struct BottomSource {
    core: Rc<RefCell<Core>>,
}

impl Source for BottomSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        self.core.borrow_mut().host.lower_sink = sink;
    }
}
