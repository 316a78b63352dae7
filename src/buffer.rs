//! Reference-counted byte buffers (spec §3, §4.A).
//!
//! The original `GG_Buffer`/`GG_DynamicBuffer` pair is a manually
//! refcounted, two-phase (mutable-then-published) container. Rust's
//! ownership model already gives us that refcounting for free, so `retain`
//! and `release` become `Clone` and `Drop` on a handle wrapping
//! `Rc<RefCell<Inner>>` — the same `Rc<RefCell<_>>` shape
//! `tapip_rs::phy::TunTapInterface` uses to share its descriptor between
//! the `RxToken`/`TxToken` pair it hands out.
//!
//! A [`Buffer`] is single-threaded by design (spec §5: "Buffer references
//! use single-threaded reference counts; cross-thread buffer transfer MUST
//! go through the sink proxy, which clones"). Moving one across threads is
//! a compile error, which is the point: it forces callers through
//! [`crate::event_loop::sink_proxy::SinkProxy`], which performs the deep
//! copy spec §5 requires.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};

#[derive(Debug)]
enum Storage {
    /// Borrows external memory; never freed by us. Used for data the
    /// caller guarantees will outlive every consumer (e.g. a `'static`
    /// test fixture).
    Static(&'static [u8]),
    /// Owns a heap allocation. Resizable with [`Buffer::use_data`]/
    /// [`Buffer::set_size`] before the first time it's shared across a
    /// sink boundary; callers must treat it as immutable after that
    /// (spec §3's Buffer invariant), though nothing in the type system
    /// enforces this beyond documentation, matching the original's
    /// convention-based contract.
    Dynamic(Vec<u8>),
}

#[derive(Debug)]
struct Inner {
    storage: Storage,
    size: usize,
}

/// A reference-counted, single-threaded owning view over a byte range.
#[derive(Debug, Clone)]
pub struct Buffer {
    inner: Rc<RefCell<Inner>>,
}

impl Buffer {
    /// Wrap borrowed `'static` memory with no allocation and no eventual
    /// free.
    pub fn from_static(data: &'static [u8]) -> Buffer {
        let size = data.len();
        Buffer {
            inner: Rc::new(RefCell::new(Inner {
                storage: Storage::Static(data),
                size,
            })),
        }
    }

    /// Allocate a dynamic buffer of `capacity` bytes, initially reporting
    /// size 0 until [`set_size`](Buffer::set_size) is called.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            inner: Rc::new(RefCell::new(Inner {
                storage: Storage::Dynamic(vec![0u8; capacity]),
                size: 0,
            })),
        }
    }

    /// Copy `data` into a freshly allocated dynamic buffer, publishing it
    /// at full size immediately.
    pub fn copy_from_slice(data: &[u8]) -> Buffer {
        let buffer = Buffer::with_capacity(data.len());
        buffer.use_data(|dst| dst.copy_from_slice(data));
        buffer.set_size(data.len());
        buffer
    }

    /// Number of additional owners of this buffer's storage. Exposed for
    /// tests and diagnostics; the original's `retain`/`release` pair is
    /// otherwise implicit in `Clone`/`Drop` here.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn size(&self) -> usize {
        self.inner.borrow().size
    }

    /// Borrow the published bytes. Panics if another borrow (e.g. an
    /// in-progress [`use_data`](Buffer::use_data)) is live, matching the
    /// "no concurrent mutation across a shared borrow" invariant of spec §3.
    pub fn data(&self) -> std::cell::Ref<'_, [u8]> {
        std::cell::Ref::map(self.inner.borrow(), |inner| {
            let size = inner.size;
            match &inner.storage {
                Storage::Static(s) => &s[..size],
                Storage::Dynamic(v) => &v[..size],
            }
        })
    }

    /// Mutate a dynamic buffer's storage before publication. No-op on a
    /// static buffer beyond invoking `f` with an empty slice (mirrors the
    /// original, where mutating a static buffer is simply not offered by
    /// its API at all; we keep a single `Buffer` type for ergonomics and
    /// degrade gracefully instead).
    pub fn use_data(&self, f: impl FnOnce(&mut [u8])) {
        let mut inner = self.inner.borrow_mut();
        match &mut inner.storage {
            Storage::Dynamic(v) => f(&mut v[..]),
            Storage::Static(_) => f(&mut []),
        }
    }

    /// Publish `size` bytes of a dynamic buffer. Panics if `size` exceeds
    /// the allocated capacity.
    pub fn set_size(&self, size: usize) {
        let mut inner = self.inner.borrow_mut();
        if let Storage::Dynamic(v) = &inner.storage {
            assert!(size <= v.len(), "Buffer::set_size exceeds capacity");
        }
        inner.size = size;
    }
}

/// Tagged metadata parcel attached to a data transfer (spec §3, §4.A).
///
/// Unknown tags round-trip through [`clone_metadata`] untouched even
/// though producers/consumers never interpret them, matching spec §3:
/// "Unknown tags are copied verbatim by the cloner but ignored by
/// producers/consumers."
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// The remote peer that sent this datagram.
    SourceSocketAddress(std::net::SocketAddrV4),
    /// The peer to which this datagram must be sent.
    DestinationSocketAddress(std::net::SocketAddrV4),
    /// A tag this build doesn't know how to interpret, preserved verbatim.
    Unknown { tag: u32, data: Vec<u8> },
}

const BASE_METADATA_SIZE: usize = 6; // 4-byte IPv4 address + 2-byte port

impl Metadata {
    /// Deep-copy this metadata. Sinks that retain a borrowed metadata
    /// reference past the end of `put_data` MUST clone it (spec §4.B);
    /// this is that clone operation.
    pub fn clone_metadata(&self) -> Result<Metadata> {
        if let Metadata::Unknown { data, .. } = self {
            if data.len() < BASE_METADATA_SIZE {
                return Err(Error::InvalidParameters);
            }
        }
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_buffer_publish_roundtrip() {
        let buf = Buffer::with_capacity(4);
        buf.use_data(|d| d.copy_from_slice(&[1, 2, 3, 4]));
        buf.set_size(4);
        assert_eq!(&*buf.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn clone_shares_storage() {
        let buf = Buffer::copy_from_slice(&[9, 8, 7]);
        let clone = buf.clone();
        assert_eq!(buf.strong_count(), 2);
        assert_eq!(&*clone.data(), &[9, 8, 7]);
        drop(buf);
        assert_eq!(clone.strong_count(), 1);
    }

    #[test]
    fn static_buffer_is_immutable() {
        static DATA: [u8; 3] = [1, 2, 3];
        let buf = Buffer::from_static(&DATA);
        assert_eq!(buf.size(), 3);
        assert_eq!(&*buf.data(), &[1, 2, 3]);
    }

    #[test]
    fn unknown_metadata_round_trips_verbatim() {
        let meta = Metadata::Unknown {
            tag: 42,
            data: vec![0; BASE_METADATA_SIZE],
        };
        let cloned = meta.clone_metadata().unwrap();
        assert_eq!(meta, cloned);
    }

    #[test]
    fn undersized_metadata_is_rejected() {
        let meta = Metadata::Unknown {
            tag: 1,
            data: vec![0; BASE_METADATA_SIZE - 1],
        };
        assert_eq!(meta.clone_metadata(), Err(Error::InvalidParameters));
    }
}
