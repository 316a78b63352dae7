//! The pluggable handshake/record engine behind [`super::DtlsElement`].
//!
//! `gg_mbedtls_tls.c` is one "port" of `GG_DtlsProtocol`: the state machine
//! in that file drives an mbedTLS `mbedtls_ssl_context` through a handful of
//! callback seams (`Send`/`Receive`/`ResolvePsk`, plus the handshake-step
//! loop itself). [`Engine`] is that seam pulled out as a Rust trait so the
//! element logic in `super` never touches a concrete TLS library directly.
//! A real port (e.g. backed by `rustls` or a DTLS-capable fork of it) would
//! implement this trait the way `gg_mbedtls_tls.c` implements the C vtable.

use crate::error::{Error, Result};

/// Outcome of one `Engine::step_handshake` call, mirroring the three ways
/// `mbedtls_ssl_handshake_step` can return in `GG_DtlsProtocol_AdvanceHandshake`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Made progress; the caller should call `step_handshake` again.
    Progressed,
    /// Nothing more to do until a record arrives from the transport.
    WantRead,
    /// Nothing more to do until a pending outbound record is flushed.
    WantWrite,
    /// The handshake finished; the engine is ready to carry application data.
    Complete,
    /// The handshake failed outright.
    Failed(Error),
}

/// Server-side PSK identity resolution, invoked synchronously while
/// processing a ClientHello (`GG_DtlsProtocol_ResolvePsk`).
pub trait KeyResolver {
    /// Look up the pre-shared key for `identity`. Returning `None` fails
    /// the handshake with [`Error::UnknownIdentity`], matching
    /// `MBEDTLS_ERR_SSL_UNKNOWN_IDENTITY`.
    fn resolve(&mut self, identity: &[u8]) -> Option<Vec<u8>>;
}

/// The handshake/record engine a [`super::DtlsElement`] drives.
///
/// An `Engine` is configured once (client or server) and then driven purely
/// through this trait: the element never reaches into engine internals, the
/// same separation `GG_DtlsProtocol` keeps from the mbedTLS context it wraps.
pub trait Engine {
    /// Configure as a client with a fixed PSK identity and key.
    fn configure_client(&mut self, psk_identity: Vec<u8>, psk: Vec<u8>);

    /// Configure as a server that resolves PSK identities on demand.
    fn configure_server(&mut self, key_resolver: Box<dyn KeyResolver>);

    /// Advance the handshake by one step. Called in a loop by the element
    /// until it returns anything other than `Progressed`.
    fn step_handshake(&mut self) -> HandshakeStep;

    /// Reset to the engine's initial, pre-handshake state.
    fn reset(&mut self);

    /// The PSK identity negotiated during the handshake, if any. Only
    /// meaningful once the handshake has completed.
    fn negotiated_identity(&self) -> Option<Vec<u8>>;

    /// Largest application payload that fits in one outgoing record,
    /// mirroring `mbedtls_ssl_get_max_out_record_payload`.
    fn max_record_payload(&self) -> usize;

    /// Feed one inbound DTLS record (a whole UDP datagram's worth of
    /// ciphertext) into the engine.
    fn push_incoming_record(&mut self, record: &[u8]);

    /// Take the next outbound DTLS record ready to be put on the wire, if
    /// any. The element calls this after `step_handshake`/app-data writes
    /// to drain whatever the engine produced.
    fn pop_outgoing_record(&mut self) -> Option<Vec<u8>>;

    /// Hand application bytes to the engine to be sealed into a record.
    /// Only valid once the handshake is complete.
    fn push_outgoing_app_data(&mut self, data: &[u8]) -> Result<()>;

    /// Take the next chunk of decrypted application data the engine has
    /// produced from inbound records, if any.
    fn pop_incoming_app_data(&mut self) -> Option<Vec<u8>>;
}
