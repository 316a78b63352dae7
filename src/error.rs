//! Crate-wide error type.
//!
//! The original implementation represents every failure as a signed integer
//! result code (spec §7); `tapip_rs::wire::Error` takes the same shape but
//! hand-rolled down to a single variant, which doesn't scale to the ~13
//! categories the core actually needs. [`Error`] is the generalization:
//! still one flat enum, still cheap to match on, but with `thiserror` doing
//! the `Display`/`std::error::Error` boilerplate.

use thiserror::Error as ThisError;

/// The crate-wide result alias. Every public core API returns this.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The operation cannot complete right now; the caller must not retry
    /// immediately and must wait for the corresponding `on_can_put`/readiness
    /// notification (spec §4.B, §7).
    #[error("would block")]
    WouldBlock,

    /// A caller-supplied timeout elapsed before the operation completed.
    #[error("timed out")]
    Timeout,

    /// A caller passed a parameter that is structurally invalid (e.g. a
    /// metadata descriptor shorter than its declared base size).
    #[error("invalid parameters")]
    InvalidParameters,

    /// A caller-supplied numeric value is outside its accepted range
    /// (e.g. a Gattlink window size above 31).
    #[error("value out of range")]
    OutOfRange,

    /// Wire data failed to parse: a field sequence overflowed the input,
    /// or a structural invariant (e.g. `ihl >= 5`) was violated.
    #[error("invalid wire format")]
    InvalidFormat,

    /// A control packet was malformed or of unexpected size.
    #[error("invalid control syntax")]
    InvalidSyntax,

    #[error("out of memory")]
    OutOfMemory,

    /// A fixed-size pool (timer pool, stack instance table) is exhausted.
    #[error("out of resources")]
    OutOfResources,

    /// A DTLS server-mode key resolver rejected a PSK identity.
    #[error("unknown PSK identity")]
    UnknownIdentity,

    /// An error surfaced by the embedded TLS engine that isn't one of the
    /// above more specific categories.
    #[error("TLS error")]
    TlsError,

    /// Gattlink received a payload PSN outside the receive window while
    /// already in READY state.
    #[error("unexpected Gattlink PSN")]
    GattlinkUnexpectedPsn,

    /// The requested operation isn't implemented by this build (e.g.
    /// decompression requested with no IP config present).
    #[error("not supported")]
    NotSupported,

    /// The event loop was interrupted while waiting; only ever surfaced
    /// during termination, where it is remapped to success.
    #[error("interrupted")]
    Interrupted,
}
