//! Stack elements grounded on `gg_stack_builder.c`'s element constructors
//! that have no separate home elsewhere in this crate: the activity
//! monitor (`'A'`), the network interface (`'N'`), and the datagram
//! socket (`'S'`). Gattlink (`'G'`) and DTLS (`'D'`) are
//! [`crate::gattlink::element::GattlinkElement`] and
//! [`crate::dtls::DtlsElement`] respectively.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddrV4;
use std::rc::{Rc, Weak};

use crate::buffer::{Buffer, Metadata};
use crate::error::{Error, Result};
use crate::event_loop::IoHandler;
use crate::frame::{Assembler, Serializer};
use crate::port::{would_block_unless, ListenerSlot, Sink, SinkListener, Source};
use crate::time::Instant;
use crate::timer::{Scheduler, TimerHandle, TimerListener};

// ---------------------------------------------------------------------
// Activity monitor ('A')
// ---------------------------------------------------------------------

/// How long a direction must be silent before it is reported idle. Not
/// itself present in the excerpted original source; chosen as a modest
/// multiple of Gattlink's retransmit timeout (spec §4.E.5) so a session
/// that's merely between retransmits isn't flagged idle.
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityDirection {
    TopToBottom,
    BottomToTop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub direction: ActivityDirection,
    pub active: bool,
}

struct DirectionState {
    target: Option<Box<dyn Sink>>,
    listener: ListenerSlot,
    timer: Option<TimerHandle>,
    active: bool,
}

impl Default for DirectionState {
    fn default() -> DirectionState {
        DirectionState { target: None, listener: ListenerSlot::default(), timer: None, active: false }
    }
}

struct ActivityCore {
    self_weak: Weak<RefCell<ActivityCore>>,
    timers: Rc<RefCell<Scheduler>>,
    timeout_ms: u64,
    timer_listeners: [Rc<RefCell<dyn TimerListener>>; 2],
    down: DirectionState, // top_sink -> bottom_source target
    up: DirectionState,   // bottom_sink -> top_source target
    event_listener: Option<Box<dyn FnMut(ActivityEvent)>>,
}

impl ActivityCore {
    fn direction_mut(&mut self, which: ActivityDirection) -> &mut DirectionState {
        match which {
            ActivityDirection::TopToBottom => &mut self.down,
            ActivityDirection::BottomToTop => &mut self.up,
        }
    }

    fn note_activity(&mut self, which: ActivityDirection) {
        let idx = match which {
            ActivityDirection::TopToBottom => 0,
            ActivityDirection::BottomToTop => 1,
        };
        let listener = self.timer_listeners[idx].clone();
        let state = self.direction_mut(which);
        let handle = match state.timer {
            Some(h) => h,
            None => match self.timers.borrow_mut().create_timer() {
                Ok(h) => {
                    state.timer = Some(h);
                    h
                }
                Err(e) => {
                    log::warn!("stack: activity monitor could not arm timer: {e}");
                    return;
                }
            },
        };
        self.timers.borrow_mut().schedule(handle, listener, Instant::now(), self.timeout_ms);
        if !state.active {
            state.active = true;
            self.emit(which, true);
        }
    }

    fn on_timer_fired(&mut self, which: ActivityDirection) {
        let state = self.direction_mut(which);
        if state.active {
            state.active = false;
            self.emit(which, false);
        }
    }

    fn emit(&mut self, direction: ActivityDirection, active: bool) {
        if let Some(listener) = self.event_listener.as_mut() {
            listener(ActivityEvent { direction, active });
        }
    }

    fn forward(&mut self, which: ActivityDirection, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()> {
        self.note_activity(which);
        let state = self.direction_mut(which);
        match state.target.as_mut() {
            Some(sink) => sink.put_data(buffer, metadata),
            None => Err(Error::NotSupported),
        }
    }

    fn register_target_listener(&mut self, which: ActivityDirection) {
        let weak = self.self_weak.clone();
        let state = self.direction_mut(which);
        if let Some(sink) = state.target.as_mut() {
            sink.set_listener(Some(Box::new(TargetDrainListener { core: weak, which })));
        }
    }
}

struct TimerBridge {
    core: Weak<RefCell<ActivityCore>>,
    which: ActivityDirection,
}

impl TimerListener for TimerBridge {
    fn on_timer_fired(&mut self, _handle: TimerHandle, _elapsed: crate::time::Duration) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().on_timer_fired(self.which);
        }
    }
}

struct TargetDrainListener {
    core: Weak<RefCell<ActivityCore>>,
    which: ActivityDirection,
}

impl SinkListener for TargetDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let mut core = core.borrow_mut();
            core.direction_mut(self.which).listener.notify_if_unblocked(true);
        }
    }
}

/// Two independent pass-through monitors, one per direction, each
/// reporting an [`ActivityEvent`] on its own idle/active transitions.
#[derive(Clone)]
pub struct ActivityMonitorElement {
    core: Rc<RefCell<ActivityCore>>,
}

impl ActivityMonitorElement {
    pub fn new(timers: Rc<RefCell<Scheduler>>, timeout_ms: u64) -> ActivityMonitorElement {
        let core = Rc::new_cyclic(|weak: &Weak<RefCell<ActivityCore>>| {
            let timer_listeners: [Rc<RefCell<dyn TimerListener>>; 2] = [
                Rc::new(RefCell::new(TimerBridge { core: weak.clone(), which: ActivityDirection::TopToBottom })),
                Rc::new(RefCell::new(TimerBridge { core: weak.clone(), which: ActivityDirection::BottomToTop })),
            ];
            RefCell::new(ActivityCore {
                self_weak: weak.clone(),
                timers,
                timeout_ms,
                timer_listeners,
                down: DirectionState::default(),
                up: DirectionState::default(),
                event_listener: None,
            })
        });
        ActivityMonitorElement { core }
    }

    pub fn set_event_listener(&self, f: impl FnMut(ActivityEvent) + 'static) {
        self.core.borrow_mut().event_listener = Some(Box::new(f));
    }

    pub fn top_sink(&self) -> ActivityTopSink {
        ActivityTopSink { core: self.core.clone() }
    }
    pub fn top_source(&self) -> ActivityTopSource {
        ActivityTopSource { core: self.core.clone() }
    }
    pub fn bottom_sink(&self) -> ActivityBottomSink {
        ActivityBottomSink { core: self.core.clone() }
    }
    pub fn bottom_source(&self) -> ActivityBottomSource {
        ActivityBottomSource { core: self.core.clone() }
    }
}

pub struct ActivityTopSink {
    core: Rc<RefCell<ActivityCore>>,
}
impl Sink for ActivityTopSink {
    fn put_data(&mut self, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()> {
        self.core.borrow_mut().forward(ActivityDirection::TopToBottom, buffer, metadata)
    }
    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().down.listener.set(listener);
    }
}

pub struct ActivityTopSource {
    core: Rc<RefCell<ActivityCore>>,
}
impl Source for ActivityTopSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        self.core.borrow_mut().up.target = sink;
        self.core.borrow_mut().register_target_listener(ActivityDirection::BottomToTop);
    }
}

pub struct ActivityBottomSink {
    core: Rc<RefCell<ActivityCore>>,
}
impl Sink for ActivityBottomSink {
    fn put_data(&mut self, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()> {
        self.core.borrow_mut().forward(ActivityDirection::BottomToTop, buffer, metadata)
    }
    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().up.listener.set(listener);
    }
}

pub struct ActivityBottomSource {
    core: Rc<RefCell<ActivityCore>>,
}
impl Source for ActivityBottomSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        self.core.borrow_mut().down.target = sink;
        self.core.borrow_mut().register_target_listener(ActivityDirection::TopToBottom);
    }
}

// ---------------------------------------------------------------------
// Network interface ('N')
// ---------------------------------------------------------------------

const MAX_PENDING_UPWARD: usize = 16;

struct NetifCore {
    self_weak: Weak<RefCell<NetifCore>>,
    assembler: Assembler,
    serializer: Serializer,

    upper_sink: Option<Box<dyn Sink>>,
    upper_listener: ListenerSlot,
    pending_upward: std::collections::VecDeque<Buffer>,

    lower_sink: Option<Box<dyn Sink>>,
    lower_listener: ListenerSlot,
    pending_downward: Option<Vec<u8>>,
}

impl NetifCore {
    fn drain_upward(&mut self) {
        while let Some(front) = self.pending_upward.front() {
            let Some(sink) = self.upper_sink.as_mut() else { break };
            match sink.put_data(front.clone(), None) {
                Ok(()) => {
                    self.pending_upward.pop_front();
                }
                Err(Error::WouldBlock) => break,
                Err(e) => {
                    log::warn!("stack: netif upper sink rejected reassembled packet: {e}");
                    self.pending_upward.pop_front();
                }
            }
        }
    }

    fn feed_inbound(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let chunk_len;
            {
                let scratch = self.assembler.feed_buffer();
                chunk_len = scratch.len().min(data.len() - offset);
                scratch[..chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
            }
            match self.assembler.feed(chunk_len) {
                Ok((consumed, Some(frame))) => {
                    offset += consumed;
                    if self.pending_upward.len() >= MAX_PENDING_UPWARD {
                        log::warn!("stack: netif pending-upward queue full, dropping reassembled packet");
                    } else {
                        self.pending_upward.push_back(frame);
                    }
                }
                Ok((consumed, None)) => offset += consumed,
                Err(e) => {
                    log::warn!("stack: netif assembler error, resynchronizing: {e}");
                    self.assembler.reset();
                    break;
                }
            }
        }
        self.drain_upward();
    }

    fn try_flush_downward(&mut self) -> bool {
        let Some(bytes) = self.pending_downward.take() else { return true };
        let Some(sink) = self.lower_sink.as_mut() else {
            self.pending_downward = Some(bytes);
            return false;
        };
        match sink.put_data(Buffer::copy_from_slice(&bytes), None) {
            Ok(()) => true,
            Err(e) => {
                if e != Error::WouldBlock {
                    log::warn!("stack: netif lower sink rejected serialized packet: {e}");
                }
                self.pending_downward = Some(bytes);
                false
            }
        }
    }

    fn handle_upper_put(&mut self, data: &[u8]) -> Result<()> {
        if self.pending_downward.is_some() {
            return Err(Error::WouldBlock);
        }
        let bytes = self.serializer.serialize(data)?;
        self.pending_downward = Some(bytes);
        self.try_flush_downward();
        Ok(())
    }

    fn register_upper_listener(&mut self) {
        let weak = self.self_weak.clone();
        if let Some(sink) = self.upper_sink.as_mut() {
            sink.set_listener(Some(Box::new(NetifUpperDrainListener { core: weak })));
        }
    }

    fn register_lower_listener(&mut self) {
        let weak = self.self_weak.clone();
        if let Some(sink) = self.lower_sink.as_mut() {
            sink.set_listener(Some(Box::new(NetifLowerDrainListener { core: weak })));
        }
    }
}

struct NetifUpperDrainListener {
    core: Weak<RefCell<NetifCore>>,
}
impl SinkListener for NetifUpperDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().drain_upward();
        }
    }
}

struct NetifLowerDrainListener {
    core: Weak<RefCell<NetifCore>>,
}
impl SinkListener for NetifLowerDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let mut core = core.borrow_mut();
            if core.try_flush_downward() {
                core.lower_listener.notify_if_unblocked(true);
            }
        }
    }
}

/// The network interface element (spec §4.H `'N'`, spec §4.F): recovers
/// whole IPv4 datagrams from the byte stream below (typically Gattlink)
/// and serializes outbound datagrams back onto it, with optional header
/// compression. Its top port carries whole packets; its bottom port
/// carries an opaque byte stream.
#[derive(Clone)]
pub struct NetworkInterfaceElement {
    core: Rc<RefCell<NetifCore>>,
}

impl NetworkInterfaceElement {
    pub fn new(assembler: Assembler, serializer: Serializer) -> NetworkInterfaceElement {
        let core = Rc::new_cyclic(|weak: &Weak<RefCell<NetifCore>>| {
            RefCell::new(NetifCore {
                self_weak: weak.clone(),
                assembler,
                serializer,
                upper_sink: None,
                upper_listener: ListenerSlot::default(),
                pending_upward: std::collections::VecDeque::new(),
                lower_sink: None,
                lower_listener: ListenerSlot::default(),
                pending_downward: None,
            })
        });
        NetworkInterfaceElement { core }
    }

    pub fn top_sink(&self) -> NetifTopSink {
        NetifTopSink { core: self.core.clone() }
    }
    pub fn top_source(&self) -> NetifTopSource {
        NetifTopSource { core: self.core.clone() }
    }
    pub fn bottom_sink(&self) -> NetifBottomSink {
        NetifBottomSink { core: self.core.clone() }
    }
    pub fn bottom_source(&self) -> NetifBottomSource {
        NetifBottomSource { core: self.core.clone() }
    }
}

pub struct NetifTopSink {
    core: Rc<RefCell<NetifCore>>,
}
impl Sink for NetifTopSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        let bytes: Vec<u8> = data.to_vec();
        drop(data);
        core.handle_upper_put(&bytes)
    }
    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().lower_listener.set(listener);
    }
}

pub struct NetifTopSource {
    core: Rc<RefCell<NetifCore>>,
}
impl Source for NetifTopSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        let mut core = self.core.borrow_mut();
        core.upper_sink = sink;
        core.register_upper_listener();
    }
}

pub struct NetifBottomSink {
    core: Rc<RefCell<NetifCore>>,
}
impl Sink for NetifBottomSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        let bytes: Vec<u8> = data.to_vec();
        drop(data);
        core.feed_inbound(&bytes);
        Ok(())
    }
    fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {
        // Inbound bytes are consumed synchronously into the reassembly
        // buffer; there is nothing to notify a caller about later.
    }
}

pub struct NetifBottomSource {
    core: Rc<RefCell<NetifCore>>,
}
impl Source for NetifBottomSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        let mut core = self.core.borrow_mut();
        core.lower_sink = sink;
        core.register_lower_listener();
    }
}

// ---------------------------------------------------------------------
// Datagram socket ('S')
// ---------------------------------------------------------------------

/// Per spec §1's Non-goals, the concrete socket port is out of scope
/// beyond its interface contract; this wraps a real non-blocking UDP
/// socket just enough to exercise that contract end to end.
const RECV_SCRATCH_SIZE: usize = 2048;
const MAX_PENDING_OUTBOUND: usize = 16;

struct SocketCore {
    socket: mio::net::UdpSocket,
    last_peer: Option<SocketAddrV4>,

    upper_sink: Option<Box<dyn Sink>>,
    upper_listener: ListenerSlot,
    pending_outbound: std::collections::VecDeque<(Vec<u8>, SocketAddrV4)>,
}

impl SocketCore {
    fn send_pending(&mut self) {
        while let Some((bytes, peer)) = self.pending_outbound.front() {
            match self.socket.send_to(bytes, std::net::SocketAddr::V4(*peer)) {
                Ok(_) => {
                    self.pending_outbound.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("stack: datagram socket send failed: {e}");
                    self.pending_outbound.pop_front();
                }
            }
        }
    }

    fn recv_available(&mut self) {
        let mut scratch = [0u8; RECV_SCRATCH_SIZE];
        loop {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, std::net::SocketAddr::V4(peer))) => {
                    self.last_peer = Some(peer);
                    let Some(sink) = self.upper_sink.as_mut() else { continue };
                    let metadata = Metadata::SourceSocketAddress(peer);
                    match sink.put_data(Buffer::copy_from_slice(&scratch[..n]), Some(&metadata)) {
                        Ok(()) => {}
                        Err(Error::WouldBlock) => {
                            log::warn!("stack: datagram socket upper sink blocked, dropping inbound datagram");
                        }
                        Err(e) => log::warn!("stack: datagram socket upper sink rejected datagram: {e}"),
                    }
                }
                Ok((_, std::net::SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("stack: datagram socket recv failed: {e}");
                    break;
                }
            }
        }
    }
}

impl IoHandler for SocketCore {
    fn on_ready(&mut self, readable: bool, writable: bool) {
        if writable {
            self.send_pending();
        }
        if readable {
            self.recv_available();
        }
    }
}

/// The terminal, transport-owning element (spec §4.H `'S'`): a real UDP
/// socket. Only a top port exists; it is always the bottom-most element
/// in a descriptor.
pub struct DatagramSocketElement {
    core: Rc<RefCell<SocketCore>>,
}

impl DatagramSocketElement {
    pub fn bind(
        local_port: u16,
        event_loop: &mut crate::event_loop::EventLoop,
    ) -> io::Result<DatagramSocketElement> {
        let addr: std::net::SocketAddr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, local_port).into();
        let socket = mio::net::UdpSocket::bind(addr)?;
        let core = Rc::new(RefCell::new(SocketCore {
            last_peer: None,
            upper_sink: None,
            upper_listener: ListenerSlot::default(),
            pending_outbound: std::collections::VecDeque::new(),
            socket,
        }));
        {
            let mut core_mut = core.borrow_mut();
            event_loop.register_io(
                &mut core_mut.socket,
                mio::Interest::READABLE | mio::Interest::WRITABLE,
                Box::new(ProxyHandler { core: core.clone() }),
            )?;
        }
        Ok(DatagramSocketElement { core })
    }

    pub fn top_sink(&self) -> SocketTopSink {
        SocketTopSink { core: self.core.clone() }
    }
    pub fn top_source(&self) -> SocketTopSource {
        SocketTopSource { core: self.core.clone() }
    }
}

/// Forwards `IoHandler` callbacks to the shared core; kept separate so
/// `EventLoop::register_io` (which takes ownership of the handler) doesn't
/// need to own the socket itself.
struct ProxyHandler {
    core: Rc<RefCell<SocketCore>>,
}
impl IoHandler for ProxyHandler {
    fn on_ready(&mut self, readable: bool, writable: bool) {
        self.core.borrow_mut().on_ready(readable, writable);
    }
}

pub struct SocketTopSink {
    core: Rc<RefCell<SocketCore>>,
}
impl Sink for SocketTopSink {
    fn put_data(&mut self, buffer: Buffer, metadata: Option<&Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let peer = match metadata {
            Some(Metadata::DestinationSocketAddress(addr)) => *addr,
            _ => match core.last_peer {
                Some(addr) => addr,
                None => return Err(Error::InvalidParameters),
            },
        };
        would_block_unless(core.pending_outbound.len() < MAX_PENDING_OUTBOUND)?;
        let data = buffer.data();
        core.pending_outbound.push_back((data.to_vec(), peer));
        drop(data);
        core.send_pending();
        Ok(())
    }
    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().upper_listener.set(listener);
    }
}

pub struct SocketTopSource {
    core: Rc<RefCell<SocketCore>>,
}
impl Source for SocketTopSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        self.core.borrow_mut().upper_sink = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::DEFAULT_POOL_SIZE;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSink {
        received: Rc<StdRefCell<Vec<Vec<u8>>>>,
    }
    impl Sink for RecordingSink {
        fn put_data(&mut self, buffer: Buffer, _metadata: Option<&Metadata>) -> Result<()> {
            self.received.borrow_mut().push(buffer.data().to_vec());
            Ok(())
        }
        fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {}
    }

    #[test]
    fn activity_monitor_passes_data_through_and_reports_active() {
        let timers = Rc::new(RefCell::new(Scheduler::new(DEFAULT_POOL_SIZE)));
        let monitor = ActivityMonitorElement::new(timers, DEFAULT_INACTIVITY_TIMEOUT_MS);
        let down_received = Rc::new(StdRefCell::new(Vec::new()));
        monitor.bottom_source().set_sink(Some(Box::new(RecordingSink { received: down_received.clone() })));

        let events = Rc::new(StdRefCell::new(Vec::new()));
        let events_clone = events.clone();
        monitor.set_event_listener(move |e| events_clone.borrow_mut().push(e));

        monitor.top_sink().put_data(Buffer::copy_from_slice(b"hi"), None).unwrap();
        assert_eq!(down_received.borrow().as_slice(), &[b"hi".to_vec()]);
        assert!(events.borrow().contains(&ActivityEvent {
            direction: ActivityDirection::TopToBottom,
            active: true
        }));
    }

    #[test]
    fn netif_round_trips_a_packet_through_gattlink_shaped_byte_stream() {
        use crate::frame::compression::IpConfig;
        use crate::frame::ipv4::{Ipv4Header, PROTOCOL_UDP};

        let netif = NetworkInterfaceElement::new(Assembler::new(256), Serializer::new(false, IpConfig::default()));
        let wire = Rc::new(StdRefCell::new(Vec::new()));
        netif.bottom_source().set_sink(Some(Box::new(RecordingSink { received: wire.clone() })));

        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 20 + 4,
            identification: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: PROTOCOL_UDP - 1, // not udp, avoid needing a udp header
            checksum: 0,
            src_address: 0x0A00_0001,
            dst_address: 0x0A00_0002,
            options: vec![],
        };
        let mut packet = ip.serialize(true).unwrap();
        packet.extend_from_slice(b"ping");
        netif.top_sink().put_data(Buffer::copy_from_slice(&packet), None).unwrap();

        let on_wire = wire.borrow_mut().remove(0);
        let delivered = Rc::new(StdRefCell::new(Vec::new()));
        netif.top_source().set_sink(Some(Box::new(RecordingSink { received: delivered.clone() })));
        netif.bottom_sink().put_data(Buffer::copy_from_slice(&on_wire), None).unwrap();

        assert_eq!(delivered.borrow().as_slice(), &[packet]);
    }
}
