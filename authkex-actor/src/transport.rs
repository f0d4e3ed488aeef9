//! The byte-stream transport seam.
//!
//! Transports are non-blocking and cooperatively scheduled: both read
//! and write return immediately, with `io::ErrorKind::WouldBlock`
//! meaning "nothing right now, wait for the next readiness event". A
//! read of `Ok(0)` means the peer closed the stream.

use std::io;

/// Identifies a readiness source to the external reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// Observer for transport health, owned by whoever owns the transport's
/// statistics (connection pools, dashboards). Notified once per
/// handshake outcome.
pub trait TransportStats {
    /// The handshake over this transport failed.
    fn on_error(&self);
    /// The handshake over this transport made it to a key.
    fn on_progress(&self);
}

impl std::fmt::Debug for dyn RawTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTransport")
            .field("source_id", &self.source_id())
            .finish_non_exhaustive()
    }
}

/// A non-blocking byte-stream connection.
pub trait RawTransport {
    /// Read whatever is currently available into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream; `WouldBlock` means no
    /// bytes are available yet.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `data` as the transport accepts right now.
    ///
    /// `WouldBlock` means the transport cannot accept anything yet.
    fn write_available(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Close the underlying stream. Idempotent.
    fn close(&mut self);

    /// The readiness source the reactor should watch for this transport.
    fn source_id(&self) -> SourceId;

    /// Stats observer, if one is attached.
    fn stats(&self) -> Option<&dyn TransportStats> {
        None
    }
}
