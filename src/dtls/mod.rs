//! DTLS element (spec §4.G): wraps an [`engine::Engine`] as a source/sink
//! pair with a handshake lifecycle, the same shape `gg_mbedtls_tls.c`'s
//! `GG_DtlsProtocol` gives `GG_TlsProtocol`. Ported onto the
//! `Rc<RefCell<Core>>` + small port-handle pattern [`crate::gattlink::element`]
//! already established for wiring a stack element into the loop.

pub mod engine;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::port::{ListenerSlot, Sink, SinkListener, Source};

use engine::Engine;
pub use engine::KeyResolver;

/// Smallest `max_datagram_size` a [`DtlsElement`] accepts, grounded on
/// `GG_DTLS_MIN_DATAGRAM_SIZE` (not itself present in the excerpted
/// original source; set to the smallest record size a handshake can
/// plausibly fit in, matching how other constructors in this crate reject
/// clearly-too-small caller-supplied sizes).
pub const MIN_DATAGRAM_SIZE: usize = 64;
/// Largest `max_datagram_size` a [`DtlsElement`] accepts, grounded on
/// `GG_DTLS_MAX_DATAGRAM_SIZE`; chosen as the common Ethernet MTU, well
/// above any link-layer MTU Gattlink would realistically advertise.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    Init,
    Handshake,
    Session,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub enum DtlsEvent {
    TlsStateChange(DtlsState),
}

#[derive(Debug, Clone)]
pub struct DtlsStatus {
    pub state: DtlsState,
    pub last_error: Option<Error>,
    /// The negotiated PSK identity, populated only once `state == Session`
    /// (`GG_DtlsProtocol_GetStatus` does the same).
    pub psk_identity: Option<Vec<u8>>,
}

/// Client-side construction parameters: a fixed identity and key, known
/// up front (a server instead takes a [`KeyResolver`], resolved per
/// ClientHello).
pub struct ClientConfig {
    pub psk_identity: Vec<u8>,
    pub psk: Vec<u8>,
}

struct Core {
    role: Role,
    state: DtlsState,
    last_error: Option<Error>,
    /// Reentrancy guard around [`Core::advance`], mirroring
    /// `GG_DtlsProtocol::in_advance`: the engine never calls back into us
    /// synchronously today, but a future real engine's I/O callbacks might.
    in_advance: bool,
    #[allow(dead_code)]
    max_datagram_size: usize,
    engine: Box<dyn Engine>,

    upper_sink: Option<Box<dyn Sink>>,
    /// Notified once a previously blocked `TopSink::put_data` can be
    /// retried, i.e. once we return to `Session` with no pending outbound
    /// record.
    upper_listener: ListenerSlot,
    /// One slot of decrypted application data waiting on the upper sink,
    /// mirroring `user_side.pending_out`.
    pending_outbound_app: Option<Vec<u8>>,

    lower_sink: Option<Box<dyn Sink>>,
    /// One slot of an outbound DTLS record waiting on the transport sink,
    /// mirroring `transport_side.pending_out`.
    pending_outbound_record: Option<Vec<u8>>,

    event_listener: Option<Box<dyn FnMut(DtlsEvent)>>,
}

impl Core {
    fn transition(&mut self, state: DtlsState) {
        self.state = state;
        if let Some(listener) = self.event_listener.as_mut() {
            listener(DtlsEvent::TlsStateChange(state));
        }
    }

    /// Pulls one record out of the engine if we have room to hold it, then
    /// tries to push it at the transport. Mirrors the way `Send()` in the
    /// original sets `pending_out` and immediately attempts a flush.
    fn pump_outgoing_record(&mut self) {
        if self.pending_outbound_record.is_none() {
            self.pending_outbound_record = self.engine.pop_outgoing_record();
        }
        self.try_flush_outgoing_record();
    }

    /// Tries to hand `pending_outbound_record` to the transport sink.
    /// Cleared only on success; a `WouldBlock` *or* a harder error both
    /// leave it queued for the next `on_lower_can_put`/handshake step,
    /// matching `GG_DtlsProtocol_TransportSide_TryToFlush`.
    fn try_flush_outgoing_record(&mut self) -> bool {
        let Some(record) = self.pending_outbound_record.take() else {
            return true;
        };
        let Some(sink) = self.lower_sink.as_mut() else {
            self.pending_outbound_record = Some(record);
            return false;
        };
        match sink.put_data(Buffer::copy_from_slice(&record), None) {
            Ok(()) => true,
            Err(e) => {
                if e != Error::WouldBlock {
                    log::warn!("dtls: transport sink rejected outbound record: {e}");
                }
                self.pending_outbound_record = Some(record);
                false
            }
        }
    }

    /// Delivers decrypted application data to the upper sink. Unlike
    /// `try_flush_outgoing_record`, any outcome other than `WouldBlock`
    /// (success *or* hard failure) drops the item, matching
    /// `GG_DtlsProtocol_UserSide_PumpData`.
    fn try_deliver_app_data(&mut self) {
        let Some(sink) = self.upper_sink.as_mut() else {
            return;
        };
        loop {
            let data = match self.pending_outbound_app.take() {
                Some(data) => data,
                None => match self.engine.pop_incoming_app_data() {
                    Some(data) => data,
                    None => return,
                },
            };
            match sink.put_data(Buffer::copy_from_slice(&data), None) {
                Ok(()) => continue,
                Err(Error::WouldBlock) => {
                    self.pending_outbound_app = Some(data);
                    self.upper_listener.note_blocked();
                    return;
                }
                Err(e) => {
                    log::warn!("dtls: upper sink rejected delivered app data: {e}");
                    continue;
                }
            }
        }
    }

    /// The reentrancy-guarded pump loop, ported from
    /// `GG_DtlsProtocol_AdvanceHandshake`: steps the handshake until it
    /// needs a read or a write, handling completion and (for servers)
    /// silent re-arming after a failed handshake.
    fn advance(&mut self) {
        if self.in_advance {
            return;
        }
        self.in_advance = true;
        loop {
            match self.state {
                DtlsState::Init => {
                    self.transition(DtlsState::Handshake);
                }
                DtlsState::Handshake => {
                    let step = self.engine.step_handshake();
                    self.pump_outgoing_record();
                    match step {
                        engine::HandshakeStep::Progressed => continue,
                        engine::HandshakeStep::WantRead | engine::HandshakeStep::WantWrite => {
                            break;
                        }
                        engine::HandshakeStep::Complete => {
                            self.transition(DtlsState::Session);
                            break;
                        }
                        engine::HandshakeStep::Failed(e) => {
                            self.last_error = Some(e);
                            self.transition(DtlsState::Error);
                            if self.role == Role::Server {
                                // Mirrors `GG_DtlsProtocol_Reset`, which
                                // clears `last_error` on its way back to a
                                // startable state.
                                self.engine.reset();
                                self.pending_outbound_record = None;
                                self.last_error = None;
                                self.transition(DtlsState::Handshake);
                                continue;
                            }
                            break;
                        }
                    }
                }
                DtlsState::Session => {
                    self.pump_outgoing_record();
                    self.try_deliver_app_data();
                    break;
                }
                DtlsState::Error => break,
            }
        }
        self.in_advance = false;
    }

    fn handle_upper_put(&mut self, data: &[u8]) -> Result<()> {
        if self.state == DtlsState::Error {
            return Err(Error::TlsError);
        }
        if self.state != DtlsState::Session {
            return Err(Error::WouldBlock);
        }
        if data.len() > self.engine.max_record_payload() {
            return Err(Error::OutOfRange);
        }
        if self.pending_outbound_record.is_some() {
            return Err(Error::WouldBlock);
        }
        self.engine.push_outgoing_app_data(data)?;
        self.pump_outgoing_record();
        Ok(())
    }

    fn handle_lower_put(&mut self, data: &[u8]) -> Result<()> {
        // The original buffers at most one not-yet-consumed inbound record
        // per direction; in this port the engine consumes a whole record
        // in one call (there is no partial-read seam to stall on), so the
        // only time a second record can arrive before the first is fully
        // processed is a reentrant call while `advance` is already running.
        if self.in_advance {
            return Err(Error::WouldBlock);
        }
        self.engine.push_incoming_record(data);
        match self.state {
            DtlsState::Handshake | DtlsState::Session => self.advance(),
            DtlsState::Init | DtlsState::Error => {}
        }
        Ok(())
    }

    fn on_lower_can_put(&mut self) {
        if self.try_flush_outgoing_record() {
            match self.state {
                DtlsState::Handshake => self.advance(),
                DtlsState::Session => self.upper_listener.notify_if_unblocked(true),
                DtlsState::Init | DtlsState::Error => {}
            }
        }
    }

    fn status(&self) -> DtlsStatus {
        DtlsStatus {
            state: self.state,
            last_error: self.last_error,
            psk_identity: if self.state == DtlsState::Session {
                self.engine.negotiated_identity()
            } else {
                None
            },
        }
    }
}

struct UpperAppDrainListener {
    core: Weak<RefCell<Core>>,
}

impl SinkListener for UpperAppDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().try_deliver_app_data();
        }
    }
}

struct LowerDrainListener {
    core: Weak<RefCell<Core>>,
}

impl SinkListener for LowerDrainListener {
    fn on_can_put(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().on_lower_can_put();
        }
    }
}

/// The DTLS stack element: an [`Engine`] bound to real ports. Cheap to
/// clone (all handles share one [`Core`]).
#[derive(Clone)]
pub struct DtlsElement {
    core: Rc<RefCell<Core>>,
}

impl DtlsElement {
    pub fn new_client(max_datagram_size: usize, config: ClientConfig, mut engine: Box<dyn Engine>) -> Result<DtlsElement> {
        if !(MIN_DATAGRAM_SIZE..=MAX_DATAGRAM_SIZE).contains(&max_datagram_size) {
            return Err(Error::InvalidParameters);
        }
        engine.configure_client(config.psk_identity, config.psk);
        Ok(DtlsElement::new(Role::Client, max_datagram_size, engine))
    }

    pub fn new_server(
        max_datagram_size: usize,
        key_resolver: Box<dyn KeyResolver>,
        mut engine: Box<dyn Engine>,
    ) -> Result<DtlsElement> {
        if !(MIN_DATAGRAM_SIZE..=MAX_DATAGRAM_SIZE).contains(&max_datagram_size) {
            return Err(Error::InvalidParameters);
        }
        engine.configure_server(key_resolver);
        Ok(DtlsElement::new(Role::Server, max_datagram_size, engine))
    }

    fn new(role: Role, max_datagram_size: usize, engine: Box<dyn Engine>) -> DtlsElement {
        let core = Rc::new_cyclic(|_weak: &Weak<RefCell<Core>>| {
            RefCell::new(Core {
                role,
                state: DtlsState::Init,
                last_error: None,
                in_advance: false,
                max_datagram_size,
                engine,
                upper_sink: None,
                upper_listener: ListenerSlot::default(),
                pending_outbound_app: None,
                lower_sink: None,
                pending_outbound_record: None,
                event_listener: None,
            })
        });
        DtlsElement { core }
    }

    /// Starts the handshake. Only valid from `INIT`
    /// (`GG_DtlsProtocol_StartHandshake`).
    pub fn start(&self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.state != DtlsState::Init {
            return Err(Error::InvalidParameters);
        }
        core.advance();
        Ok(())
    }

    /// Resets to `INIT`, discarding any in-progress handshake or session.
    /// A no-op if already `INIT` (`GG_DtlsProtocol_Reset`).
    pub fn reset(&self) {
        let mut core = self.core.borrow_mut();
        if core.state == DtlsState::Init {
            return;
        }
        core.engine.reset();
        core.pending_outbound_record = None;
        core.pending_outbound_app = None;
        core.last_error = None;
        core.transition(DtlsState::Init);
    }

    pub fn state(&self) -> DtlsState {
        self.core.borrow().state
    }

    pub fn status(&self) -> DtlsStatus {
        self.core.borrow().status()
    }

    pub fn set_event_listener(&self, f: impl FnMut(DtlsEvent) + 'static) {
        self.core.borrow_mut().event_listener = Some(Box::new(f));
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

/// Accepts plaintext application datagrams to be encrypted and sent.
pub struct TopSink {
    core: Rc<RefCell<Core>>,
}

impl Sink for TopSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&crate::buffer::Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        core.handle_upper_put(&data)
    }

    fn set_listener(&mut self, listener: Option<Box<dyn SinkListener>>) {
        self.core.borrow_mut().upper_listener.set(listener);
    }
}

/// Registers the sink that receives our decrypted application datagrams.
pub struct TopSource {
    core: Rc<RefCell<Core>>,
}

impl Source for TopSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        let mut core = self.core.borrow_mut();
        core.upper_sink = sink;
        if let Some(sink) = core.upper_sink.as_mut() {
            let weak = Rc::downgrade(&self.core);
            sink.set_listener(Some(Box::new(UpperAppDrainListener { core: weak })));
        }
    }
}

/// Accepts DTLS records arriving from the transport.
pub struct BottomSink {
    core: Rc<RefCell<Core>>,
}

impl Sink for BottomSink {
    fn put_data(&mut self, buffer: Buffer, _metadata: Option<&crate::buffer::Metadata>) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let data = buffer.data();
        core.handle_lower_put(&data)
    }

    fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {
        // Inbound records are consumed whole in one `handle_lower_put`
        // call (see its comment); there is nothing to notify a caller
        // about later.
    }
}

/// Registers the sink that receives our outbound DTLS records.
pub struct BottomSource {
    core: Rc<RefCell<Core>>,
}

impl Source for BottomSource {
    fn set_sink(&mut self, sink: Option<Box<dyn Sink>>) {
        let mut core = self.core.borrow_mut();
        core.lower_sink = sink;
        if let Some(sink) = core.lower_sink.as_mut() {
            let weak = Rc::downgrade(&self.core);
            sink.set_listener(Some(Box::new(LowerDrainListener { core: weak })));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::engine::test_engine::TestEngine;
    use super::*;
    use crate::buffer::Metadata;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSink {
        received: Rc<StdRefCell<Vec<Vec<u8>>>>,
        blocked_until: usize,
    }

    impl Sink for RecordingSink {
        fn put_data(&mut self, buffer: Buffer, _metadata: Option<&Metadata>) -> Result<()> {
            if self.received.borrow().len() < self.blocked_until {
                return Err(Error::WouldBlock);
            }
            self.received.borrow_mut().push(buffer.data().to_vec());
            Ok(())
        }
        fn set_listener(&mut self, _listener: Option<Box<dyn SinkListener>>) {}
    }

    struct StaticResolver(Vec<u8>, Vec<u8>);
    impl KeyResolver for StaticResolver {
        fn resolve(&mut self, identity: &[u8]) -> Option<Vec<u8>> {
            if identity == self.0.as_slice() {
                Some(self.1.clone())
            } else {
                None
            }
        }
    }

    fn wire(client: &DtlsElement, server: &DtlsElement) -> (Rc<StdRefCell<Vec<Vec<u8>>>>, Rc<StdRefCell<Vec<Vec<u8>>>>) {
        let c_to_s = Rc::new(StdRefCell::new(Vec::new()));
        let s_to_c = Rc::new(StdRefCell::new(Vec::new()));
        client.bottom_source().set_sink(Some(Box::new(RecordingSink {
            received: c_to_s.clone(),
            blocked_until: 0,
        })));
        server.bottom_source().set_sink(Some(Box::new(RecordingSink {
            received: s_to_c.clone(),
            blocked_until: 0,
        })));
        (c_to_s, s_to_c)
    }

    fn drain(sink: &DtlsElement, queue: &Rc<StdRefCell<Vec<Vec<u8>>>>) {
        loop {
            let next = {
                let mut q = queue.borrow_mut();
                if q.is_empty() {
                    break;
                }
                q.remove(0)
            };
            sink.bottom_sink().put_data(Buffer::copy_from_slice(&next), None).unwrap();
        }
    }

    #[test]
    fn client_and_server_complete_a_handshake() {
        let client = DtlsElement::new_client(
            256,
            ClientConfig { psk_identity: b"node-1".to_vec(), psk: b"secret".to_vec() },
            Box::new(TestEngine::new()),
        )
        .unwrap();
        let server = DtlsElement::new_server(
            256,
            Box::new(StaticResolver(b"node-1".to_vec(), b"secret".to_vec())),
            Box::new(TestEngine::new()),
        )
        .unwrap();

        let (c_to_s, s_to_c) = wire(&client, &server);

        server.start().unwrap();
        client.start().unwrap();
        assert_eq!(client.state(), DtlsState::Handshake);
        drain(&server, &c_to_s);
        assert_eq!(server.state(), DtlsState::Session);
        drain(&client, &s_to_c);
        assert_eq!(client.state(), DtlsState::Session);

        let identity = client.status().psk_identity.unwrap();
        assert_eq!(identity, b"node-1");
    }

    #[test]
    fn server_rejects_unknown_identity_and_re_arms() {
        let client = DtlsElement::new_client(
            256,
            ClientConfig { psk_identity: b"unknown".to_vec(), psk: b"secret".to_vec() },
            Box::new(TestEngine::new()),
        )
        .unwrap();
        let server = DtlsElement::new_server(
            256,
            Box::new(StaticResolver(b"node-1".to_vec(), b"secret".to_vec())),
            Box::new(TestEngine::new()),
        )
        .unwrap();

        let events = Rc::new(StdRefCell::new(Vec::new()));
        let events_handle = events.clone();
        server.set_event_listener(move |e| events_handle.borrow_mut().push(e));

        let (c_to_s, _s_to_c) = wire(&client, &server);
        server.start().unwrap();
        client.start().unwrap();
        drain(&server, &c_to_s);

        // the server auto-resets to HANDSHAKE rather than sticking in ERROR,
        // and the transient error does not linger in its status
        assert_eq!(server.state(), DtlsState::Handshake);
        assert_eq!(server.status().last_error, None);
        assert!(events
            .borrow()
            .iter()
            .any(|e| matches!(e, DtlsEvent::TlsStateChange(DtlsState::Error))));
    }

    #[test]
    fn client_stays_in_error_until_explicit_reset() {
        let client = DtlsElement::new_client(
            256,
            ClientConfig { psk_identity: b"whoever".to_vec(), psk: b"secret".to_vec() },
            Box::new(TestEngine::new()),
        )
        .unwrap();
        // Feed it a garbage handshake record directly, bypassing a peer,
        // to drive it into HANDSHAKE then force a parse failure.
        client.start().unwrap();
        client
            .bottom_sink()
            .put_data(Buffer::copy_from_slice(b"not a valid handshake record"), None)
            .unwrap();
        assert_eq!(client.state(), DtlsState::Error);

        client.reset();
        assert_eq!(client.state(), DtlsState::Init);
    }

    #[test]
    fn application_data_is_blocked_until_session_established() {
        let client = DtlsElement::new_client(
            256,
            ClientConfig { psk_identity: b"node-1".to_vec(), psk: b"secret".to_vec() },
            Box::new(TestEngine::new()),
        )
        .unwrap();
        let result = client.top_sink().put_data(Buffer::copy_from_slice(b"hi"), None);
        assert_eq!(result, Err(Error::WouldBlock));
    }

    #[test]
    fn application_data_round_trips_once_sessions_are_established() {
        let client = DtlsElement::new_client(
            256,
            ClientConfig { psk_identity: b"node-1".to_vec(), psk: b"secret".to_vec() },
            Box::new(TestEngine::new()),
        )
        .unwrap();
        let server = DtlsElement::new_server(
            256,
            Box::new(StaticResolver(b"node-1".to_vec(), b"secret".to_vec())),
            Box::new(TestEngine::new()),
        )
        .unwrap();

        let (c_to_s, s_to_c) = wire(&client, &server);
        let delivered = Rc::new(StdRefCell::new(Vec::new()));
        server
            .top_source()
            .set_sink(Some(Box::new(RecordingSink { received: delivered.clone(), blocked_until: 0 })));

        server.start().unwrap();
        client.start().unwrap();
        drain(&server, &c_to_s);
        drain(&client, &s_to_c);

        client.top_sink().put_data(Buffer::copy_from_slice(b"hello dtls"), None).unwrap();
        drain(&server, &c_to_s);

        assert_eq!(delivered.borrow().as_slice(), &[b"hello dtls".to_vec()]);
    }
}
