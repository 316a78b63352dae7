//! Gattlink: a reliable, in-order byte stream over an unreliable,
//! small-MTU packet channel (spec §4.E), ported field-for-field from
//! `examples/original_source/xp/gattlink/gg_gattlink.c`.
//!
//! The protocol core ([`Session`]) is deliberately decoupled from the
//! event loop and from the [`crate::port::Sink`]/[`crate::port::Source`]
//! wiring: it drives an abstract [`SessionHost`] instead, the same
//! separation `dtls::engine::Engine` uses one layer further down for the
//! embedded TLS engine — a host/driver split is the idiomatic-Rust way to
//! keep a wire protocol's state machine unit-testable without a live
//! transport.

pub mod element;
pub mod wire;

use crate::error::{Error, Result};
use crate::time::Duration;
use wire::{ControlPacket, DataPacket, Payload};

const DELAYED_ACK_MS: u64 = 200;
const RESET_TIMEOUT_MS: u64 = 1000;
const RESET_COMPLETE_TIMEOUT_MS: u64 = 2000;
const RETRANSMIT_TIMEOUT_MS: u64 = 4000;
const STALL_NOTIFICATION_INTERVAL_MS: i64 = 12000;
const GATTLINK_VERSION: u8 = 0;

/// Default max transport packet size, used until the stack element is told
/// otherwise via [`Session::set_max_packet_size`] (spec §4.H:
/// "`LINK_MTU_CHANGE` is additionally routed into the Gattlink element so
/// it can adjust its max transport fragment size").
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    AwaitingResetSelf,
    AwaitingResetRemote,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattlinkTimer {
    DelayedAck,
    Reset,
    Retransmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SessionReady,
    SessionReset,
    /// Current accumulated stall time; `ZERO` is the implicit "stall
    /// cleared" notification (spec §4.E.5).
    Stalled(Duration),
}

/// What [`Session`] needs from its owner: send raw packets on the
/// transport, deliver reassembled bytes upstream, manage the three named
/// timers, and surface protocol events. Implemented by the stack
/// element that wires a `Session` to real sink/source ports and a real
/// timer scheduler; a test-only in-memory host drives the unit tests in
/// this module.
pub trait SessionHost {
    fn send_packet(&mut self, data: &[u8]) -> Result<()>;
    fn deliver_data(&mut self, data: &[u8]);
    fn arm_timer(&mut self, timer: GattlinkTimer, ms: u64);
    fn disarm_timer(&mut self, timer: GattlinkTimer);
    fn emit_event(&mut self, event: SessionEvent);
}

/// Configuration fixed at construction: desired window sizes in each
/// direction and the reassembly buffer's capacity.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub desired_tx_window: u8,
    pub desired_rx_window: u8,
    pub inbound_buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            desired_tx_window: wire::SN_WINDOW_SIZE - 1,
            desired_rx_window: wire::SN_WINDOW_SIZE - 1,
            inbound_buffer_capacity: 4096,
        }
    }
}

/// The Gattlink session state machine (spec §4.E.2-§4.E.5).
pub struct Session {
    config: SessionConfig,
    state: SessionState,

    tx_window: u8,
    rx_window: u8,

    outbound: std::collections::VecDeque<u8>,
    unacked: std::collections::VecDeque<(u8, Vec<u8>)>,
    next_data_sn: u8,
    next_expected_ack_sn: u8,
    resend_from: Option<usize>,
    retransmit_armed: bool,

    next_expected_data_psn: u8,
    psn_to_ack: u8,
    ack_now: bool,
    inbound_since_ack: u8,
    inbound_buffered: usize,
    delayed_ack_armed: bool,

    stall_time: Duration,
    last_notified_stall_ms: i64,
    had_reported_stall: bool,

    max_packet_size: usize,
}

impl Session {
    pub fn new(config: SessionConfig) -> Session {
        Session {
            tx_window: config.desired_tx_window,
            rx_window: config.desired_rx_window,
            config,
            state: SessionState::Initialized,
            outbound: std::collections::VecDeque::new(),
            unacked: std::collections::VecDeque::new(),
            next_data_sn: 0,
            next_expected_ack_sn: 0,
            resend_from: None,
            retransmit_armed: false,
            next_expected_data_psn: 0,
            psn_to_ack: 0,
            ack_now: false,
            inbound_since_ack: 0,
            inbound_buffered: 0,
            delayed_ack_armed: false,
            stall_time: Duration::ZERO,
            last_notified_stall_ms: 0,
            had_reported_stall: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Adjusts the max transport fragment size, e.g. in response to a
    /// `LINK_MTU_CHANGE` forwarded down from the stack builder.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    /// Begin the reset handshake (spec §4.E.2: INITIALIZED —start→
    /// AWAITING_RESET_SELF).
    pub fn start(&mut self, host: &mut impl SessionHost) {
        if self.state != SessionState::Initialized {
            return;
        }
        self.send_reset_request(host);
        self.state = SessionState::AwaitingResetSelf;
        host.arm_timer(GattlinkTimer::Reset, RESET_TIMEOUT_MS);
    }

    /// Force a fresh handshake from any state (spec §4.E.2: READY
    /// —`reset()`→ AWAITING_RESET_SELF).
    pub fn reset(&mut self, host: &mut impl SessionHost) {
        let was_ready = self.state == SessionState::Ready;
        self.reset_local_state();
        self.send_reset_request(host);
        self.state = SessionState::AwaitingResetSelf;
        host.arm_timer(GattlinkTimer::Reset, RESET_TIMEOUT_MS);
        if was_ready {
            host.emit_event(SessionEvent::SessionReset);
        }
    }

    fn reset_local_state(&mut self) {
        self.outbound.clear();
        self.unacked.clear();
        self.next_data_sn = 0;
        self.next_expected_ack_sn = 0;
        self.resend_from = None;
        self.retransmit_armed = false;
        self.next_expected_data_psn = 0;
        self.ack_now = false;
        self.inbound_since_ack = 0;
        self.inbound_buffered = 0;
        self.delayed_ack_armed = false;
        self.stall_time = Duration::ZERO;
        self.last_notified_stall_ms = 0;
        self.had_reported_stall = false;
    }

    fn send_reset_request(&mut self, host: &mut impl SessionHost) {
        let mut buf = Vec::new();
        ControlPacket::ResetRequest.encode(&mut buf);
        let _ = host.send_packet(&buf);
    }

    fn send_reset_complete(&mut self, host: &mut impl SessionHost) {
        let mut buf = Vec::new();
        ControlPacket::ResetComplete {
            min_version: GATTLINK_VERSION,
            max_version: GATTLINK_VERSION,
            max_rx_window: self.config.desired_rx_window,
            max_tx_window: self.config.desired_tx_window,
        }
        .encode(&mut buf);
        let _ = host.send_packet(&buf);
    }

    /// Queue application bytes for transmission. Returns `WouldBlock` if
    /// this would exceed the (unbounded in this build) outbound buffer —
    /// kept for API symmetry with `Sink::put_data`'s contract even though
    /// the buffer here never actually refuses.
    pub fn write_outbound(&mut self, data: &[u8], host: &mut impl SessionHost) -> Result<()> {
        self.outbound.extend(data.iter().copied());
        self.pump_output(host);
        Ok(())
    }

    /// Feed one received transport packet into the session (spec §4.E.4).
    pub fn on_packet_received(&mut self, data: &[u8], host: &mut impl SessionHost) -> Result<()> {
        let first = *data.first().ok_or(Error::InvalidSyntax)?;
        if wire::is_control(first) {
            let control = ControlPacket::decode(data)?;
            self.on_control_received(control, host);
        } else {
            if self.state != SessionState::Ready {
                // spec §4.E.6: data received outside READY (but
                // post-INITIALIZED) is silently dropped.
                return Ok(());
            }
            let packet = DataPacket::decode(data)?;
            self.on_data_received(packet, host);
        }
        Ok(())
    }

    fn on_control_received(&mut self, control: ControlPacket, host: &mut impl SessionHost) {
        match control {
            ControlPacket::ResetRequest => {
                let was_ready = self.state == SessionState::Ready;
                if was_ready {
                    self.reset_local_state();
                }
                self.send_reset_complete(host);
                self.state = SessionState::AwaitingResetRemote;
                host.arm_timer(GattlinkTimer::Reset, RESET_COMPLETE_TIMEOUT_MS);
                if was_ready {
                    host.emit_event(SessionEvent::SessionReset);
                }
            }
            ControlPacket::ResetComplete {
                max_rx_window,
                max_tx_window,
                ..
            } => {
                match self.state {
                    SessionState::AwaitingResetSelf => {
                        self.send_reset_complete(host);
                        self.negotiate_windows(max_rx_window, max_tx_window);
                        host.disarm_timer(GattlinkTimer::Reset);
                        self.state = SessionState::Ready;
                        host.emit_event(SessionEvent::SessionReady);
                        self.pump_output(host);
                    }
                    SessionState::AwaitingResetRemote => {
                        self.negotiate_windows(max_rx_window, max_tx_window);
                        host.disarm_timer(GattlinkTimer::Reset);
                        self.state = SessionState::Ready;
                        host.emit_event(SessionEvent::SessionReady);
                        self.pump_output(host);
                    }
                    _ => {}
                }
            }
        }
    }

    fn negotiate_windows(&mut self, peer_max_rx_window: u8, peer_max_tx_window: u8) {
        self.tx_window = self.config.desired_tx_window.min(peer_max_rx_window);
        self.rx_window = self.config.desired_rx_window.min(peer_max_tx_window);
    }

    fn on_data_received(&mut self, packet: DataPacket, host: &mut impl SessionHost) {
        let mut had_progress = false;

        if let Some(ack_sn) = packet.ack_sn {
            if self.unacked.iter().any(|(psn, _)| *psn == ack_sn) {
                while let Some((psn, _)) = self.unacked.front() {
                    let psn = *psn;
                    self.unacked.pop_front();
                    self.next_expected_ack_sn = wire::sn_next(psn);
                    if psn == ack_sn {
                        break;
                    }
                }
                self.resend_from = None;
                had_progress = true;
                if self.unacked.is_empty() {
                    host.disarm_timer(GattlinkTimer::Retransmit);
                    self.retransmit_armed = false;
                } else {
                    host.arm_timer(GattlinkTimer::Retransmit, RETRANSMIT_TIMEOUT_MS);
                }
            }
            // else: dup-ACK for an already-freed PSN, ignored.
        }

        if let Some(payload) = packet.payload {
            if self.inbound_buffered + payload.data.len() > self.config.inbound_buffer_capacity {
                // reassembly buffer full: drop silently, peer will retransmit.
            } else if payload.psn == self.next_expected_data_psn {
                host.deliver_data(&payload.data);
                self.inbound_buffered += payload.data.len();
                self.next_expected_data_psn = wire::sn_next(payload.psn);
                self.psn_to_ack = payload.psn;
                self.ack_now = true;
                self.inbound_since_ack += 1;
                if !self.delayed_ack_armed {
                    host.arm_timer(GattlinkTimer::DelayedAck, DELAYED_ACK_MS);
                    self.delayed_ack_armed = true;
                }
                had_progress = true;
            } else {
                let behind = wire::sn_distance(payload.psn, self.next_expected_data_psn);
                if behind > 0 && behind <= self.rx_window {
                    // Retransmission of an already-accepted packet: re-ack.
                    self.ack_now = true;
                    if !self.delayed_ack_armed {
                        host.arm_timer(GattlinkTimer::DelayedAck, DELAYED_ACK_MS);
                        self.delayed_ack_armed = true;
                    }
                } else {
                    log::warn!("gattlink: unexpected PSN {} (expected {})", payload.psn, self.next_expected_data_psn);
                }
            }
        }

        if had_progress {
            self.clear_stall(host);
        }
        self.pump_output(host);
    }

    fn clear_stall(&mut self, host: &mut impl SessionHost) {
        self.stall_time = Duration::ZERO;
        self.last_notified_stall_ms = 0;
        if self.had_reported_stall {
            self.had_reported_stall = false;
            host.emit_event(SessionEvent::Stalled(Duration::ZERO));
        }
    }

    /// Called when a timer fires; `elapsed` is the scheduler's reported
    /// elapsed time for that firing (spec §4.C).
    pub fn on_timer_fired(&mut self, timer: GattlinkTimer, elapsed: Duration, host: &mut impl SessionHost) {
        match timer {
            GattlinkTimer::Reset => match self.state {
                SessionState::AwaitingResetSelf => {
                    self.send_reset_request(host);
                    host.arm_timer(GattlinkTimer::Reset, RESET_TIMEOUT_MS);
                }
                SessionState::AwaitingResetRemote => {
                    self.send_reset_complete(host);
                    host.arm_timer(GattlinkTimer::Reset, RESET_COMPLETE_TIMEOUT_MS);
                }
                _ => {}
            },
            GattlinkTimer::DelayedAck => {
                self.delayed_ack_armed = false;
                self.pump_output(host);
            }
            GattlinkTimer::Retransmit => {
                if self.state == SessionState::Ready && !self.unacked.is_empty() {
                    self.resend_from = Some(0);
                    self.stall_time = self.stall_time.saturating_add(elapsed);
                    if self.stall_time.total_millis() as i64 - self.last_notified_stall_ms
                        > STALL_NOTIFICATION_INTERVAL_MS
                    {
                        self.last_notified_stall_ms = self.stall_time.total_millis() as i64;
                        self.had_reported_stall = true;
                        host.emit_event(SessionEvent::Stalled(self.stall_time));
                    }
                    host.arm_timer(GattlinkTimer::Retransmit, RETRANSMIT_TIMEOUT_MS);
                    self.pump_output(host);
                }
            }
        }
    }

    /// Emit as many packets as the window and available data allow
    /// (spec §4.E.3). Called after any state change that might make
    /// sending possible.
    fn pump_output(&mut self, host: &mut impl SessionHost) {
        const HEADER_OVERHEAD: usize = 2;

        if self.state != SessionState::Ready {
            return;
        }

        loop {
            let want_ack = self.ack_now
                || (self.rx_window > 0 && self.inbound_since_ack as u32 > self.rx_window as u32 / 2);

            let payload = if let Some(idx) = self.resend_from {
                if idx < self.unacked.len() {
                    let (psn, bytes) = self.unacked[idx].clone();
                    self.resend_from = Some(idx + 1);
                    Some(Payload { psn, data: bytes })
                } else {
                    self.resend_from = None;
                    None
                }
            } else {
                let in_flight = wire::sn_distance(self.next_expected_ack_sn, self.next_data_sn);
                if (in_flight as u32) < self.tx_window as u32 && !self.outbound.is_empty() {
                    let take = self.outbound.len().min(self.max_packet_size.saturating_sub(HEADER_OVERHEAD));
                    if take == 0 {
                        None
                    } else {
                        let bytes: Vec<u8> = self.outbound.drain(..take).collect();
                        let psn = self.next_data_sn;
                        self.next_data_sn = wire::sn_next(self.next_data_sn);
                        self.unacked.push_back((psn, bytes.clone()));
                        Some(Payload { psn, data: bytes })
                    }
                } else {
                    None
                }
            };

            let ack_sn = if want_ack { Some(self.psn_to_ack) } else { None };
            if ack_sn.is_none() && payload.is_none() {
                break;
            }

            let packet = DataPacket { ack_sn, payload: payload.clone() };
            let mut buf = Vec::new();
            packet.encode(&mut buf);
            if host.send_packet(&buf).is_err() {
                // Transport momentarily can't accept; stop for now, the
                // caller will retry via its own back-pressure wakeup
                // (spec §4.E.6: send failures logged, not retried here
                // beyond the normal window retransmit).
                break;
            }

            if ack_sn.is_some() {
                self.ack_now = false;
                self.inbound_since_ack = 0;
            }
            if payload.is_some() && !self.retransmit_armed {
                host.arm_timer(GattlinkTimer::Retransmit, RETRANSMIT_TIMEOUT_MS);
                self.retransmit_armed = true;
            }

            if self.resend_from.is_none() && payload.is_none() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestHost {
        sent: Vec<Vec<u8>>,
        delivered: Vec<Vec<u8>>,
        events: Vec<SessionEvent>,
        armed: Vec<(GattlinkTimer, u64)>,
        send_blocked: bool,
    }

    impl SessionHost for TestHost {
        fn send_packet(&mut self, data: &[u8]) -> Result<()> {
            if self.send_blocked {
                return Err(Error::WouldBlock);
            }
            self.sent.push(data.to_vec());
            Ok(())
        }
        fn deliver_data(&mut self, data: &[u8]) {
            self.delivered.push(data.to_vec());
        }
        fn arm_timer(&mut self, timer: GattlinkTimer, ms: u64) {
            self.armed.push((timer, ms));
        }
        fn disarm_timer(&mut self, _timer: GattlinkTimer) {}
        fn emit_event(&mut self, event: SessionEvent) {
            self.events.push(event);
        }
    }

    fn handshake(a: &mut Session, a_host: &mut TestHost, b: &mut Session, b_host: &mut TestHost) {
        a.start(a_host);
        let reset_req = a_host.sent.remove(0);
        b.on_packet_received(&reset_req, b_host).unwrap();
        let reset_complete_from_b = b_host.sent.remove(0);
        a.on_packet_received(&reset_complete_from_b, a_host).unwrap();
        let reset_complete_from_a = a_host.sent.remove(0);
        b.on_packet_received(&reset_complete_from_a, b_host).unwrap();
        assert_eq!(a.state(), SessionState::Ready);
        assert_eq!(b.state(), SessionState::Ready);
    }

    #[test]
    fn handshake_reaches_ready_on_both_sides() {
        let mut a = Session::new(SessionConfig::default());
        let mut a_host = TestHost::default();
        let mut b = Session::new(SessionConfig::default());
        let mut b_host = TestHost::default();
        handshake(&mut a, &mut a_host, &mut b, &mut b_host);
        assert!(a_host.events.contains(&SessionEvent::SessionReady));
        assert!(b_host.events.contains(&SessionEvent::SessionReady));
    }

    #[test]
    fn data_written_after_ready_round_trips() {
        let mut a = Session::new(SessionConfig::default());
        let mut a_host = TestHost::default();
        let mut b = Session::new(SessionConfig::default());
        let mut b_host = TestHost::default();
        handshake(&mut a, &mut a_host, &mut b, &mut b_host);

        a.write_outbound(b"hello", &mut a_host).unwrap();
        let packet = a_host.sent.pop().unwrap();
        b.on_packet_received(&packet, &mut b_host).unwrap();
        assert_eq!(b_host.delivered, vec![b"hello".to_vec()]);

        // b's ack comes back to a, freeing the in-flight slot.
        let ack_packet = b_host.sent.pop().unwrap();
        a.on_packet_received(&ack_packet, &mut a_host).unwrap();
    }

    #[test]
    fn retransmit_timeout_replays_unacked_data() {
        let mut a = Session::new(SessionConfig::default());
        let mut a_host = TestHost::default();
        let mut b = Session::new(SessionConfig::default());
        let mut b_host = TestHost::default();
        handshake(&mut a, &mut a_host, &mut b, &mut b_host);

        a.write_outbound(b"retry-me", &mut a_host).unwrap();
        a_host.sent.clear(); // drop the first send, simulating packet loss

        a.on_timer_fired(GattlinkTimer::Retransmit, Duration::from_millis(4000), &mut a_host);
        let replay = a_host.sent.pop().unwrap();
        let decoded = DataPacket::decode(&replay).unwrap();
        assert_eq!(decoded.payload.unwrap().data, b"retry-me");
    }

    #[test]
    fn unexpected_psn_outside_window_is_not_acked() {
        let mut config = SessionConfig::default();
        config.desired_rx_window = 4;
        let mut a = Session::new(config);
        a.rx_window = 4;
        let mut a_host = TestHost::default();
        a.state = SessionState::Ready;

        // behind = sn_distance(20, 0) = 12, which exceeds the 4-wide
        // negotiated rx window, so this can't be a retransmission of
        // something already accepted.
        let far_future = DataPacket {
            ack_sn: None,
            payload: Some(Payload { psn: 20, data: vec![1] }),
        };
        let mut buf = Vec::new();
        far_future.encode(&mut buf);
        a.on_packet_received(&buf, &mut a_host).unwrap();
        assert!(a_host.delivered.is_empty());
        assert!(!a.ack_now);
    }

    #[test]
    fn reset_request_while_ready_emits_session_reset() {
        let mut a = Session::new(SessionConfig::default());
        let mut a_host = TestHost::default();
        a.state = SessionState::Ready;

        let mut buf = Vec::new();
        ControlPacket::ResetRequest.encode(&mut buf);
        a.on_packet_received(&buf, &mut a_host).unwrap();
        assert_eq!(a.state(), SessionState::AwaitingResetRemote);
        assert!(a_host.events.contains(&SessionEvent::SessionReset));
    }

    #[test]
    fn data_outside_ready_state_is_dropped() {
        let mut a = Session::new(SessionConfig::default());
        let mut a_host = TestHost::default();
        // still INITIALIZED
        let packet = DataPacket { ack_sn: None, payload: Some(Payload { psn: 0, data: vec![1] }) };
        let mut buf = Vec::new();
        packet.encode(&mut buf);
        a.on_packet_received(&buf, &mut a_host).unwrap();
        assert!(a_host.delivered.is_empty());
    }

    // Byte-exact, in-order delivery under a lossy transport (spec property
    // 1): whatever is written on one side eventually arrives on the other
    // unchanged, as long as every packet has a chance of getting through
    // and loss doesn't exceed what the retransmit timer can recover from.
    #[test]
    fn gattlink_delivers_exactly_the_input_under_loss_and_reordering() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::VecDeque;

        let _ = env_logger::try_init();
        let mut rng = StdRng::seed_from_u64(0xC0FF_EE42);

        let mut config = SessionConfig::default();
        config.desired_tx_window = 4;
        config.desired_rx_window = 4;
        let mut a = Session::new(config);
        let mut a_host = TestHost::default();
        let mut b = Session::new(config);
        let mut b_host = TestHost::default();
        handshake(&mut a, &mut a_host, &mut b, &mut b_host);

        let input: Vec<u8> = (0..200).map(|_| rng.gen()).collect();
        a.write_outbound(&input, &mut a_host).unwrap();

        let mut a_to_b: VecDeque<Vec<u8>> = VecDeque::new();
        let mut b_to_a: VecDeque<Vec<u8>> = VecDeque::new();

        for round in 0..5000 {
            a_to_b.extend(a_host.sent.drain(..));
            b_to_a.extend(b_host.sent.drain(..));

            // Occasionally reorder the head of the queue: out-of-window
            // packets are rejected by on_packet_received the same way a
            // dropped one would be, so this folds into the loss case
            // rather than needing separate handling.
            if a_to_b.len() > 1 && rng.gen_bool(0.1) {
                a_to_b.swap(0, 1);
            }
            if b_to_a.len() > 1 && rng.gen_bool(0.1) {
                b_to_a.swap(0, 1);
            }

            if let Some(packet) = a_to_b.pop_front() {
                if rng.gen_bool(0.7) {
                    b.on_packet_received(&packet, &mut b_host).unwrap();
                }
            }
            if let Some(packet) = b_to_a.pop_front() {
                if rng.gen_bool(0.7) {
                    a.on_packet_received(&packet, &mut a_host).unwrap();
                }
            }

            // Flush pending acks and, periodically, retransmit anything
            // still unacked so loss doesn't stall the transfer forever.
            a.on_timer_fired(GattlinkTimer::DelayedAck, Duration::from_millis(DELAYED_ACK_MS), &mut a_host);
            b.on_timer_fired(GattlinkTimer::DelayedAck, Duration::from_millis(DELAYED_ACK_MS), &mut b_host);
            if round % 8 == 0 {
                a.on_timer_fired(GattlinkTimer::Retransmit, Duration::from_millis(RETRANSMIT_TIMEOUT_MS), &mut a_host);
                b.on_timer_fired(GattlinkTimer::Retransmit, Duration::from_millis(RETRANSMIT_TIMEOUT_MS), &mut b_host);
            }

            let delivered_len: usize = b_host.delivered.iter().map(Vec::len).sum();
            if delivered_len >= input.len() {
                break;
            }
        }

        let delivered: Vec<u8> = b_host.delivered.drain(..).flatten().collect();
        assert_eq!(delivered, input);
    }
}
