//! The adapter between the message-level state machine and the
//! byte-level transport.

use std::io;

use authkex_handshake::messages::Message;
use authkex_handshake::{AuthKeyHandshake, Error as ProtocolError, HandshakeContext};
use tracing::trace;

use crate::error::HandshakeError;
use crate::framing::MessageFramer;
use crate::transport::{RawTransport, SourceId};

/// Upper bound on bytes drained from the transport per `flush` call.
/// The actor re-invokes `flush` on the next readiness event, so a busy
/// transport cannot monopolize one invocation.
const READ_BUDGET: usize = 16 * 1024;

/// Stack buffer size for a single read.
const READ_CHUNK: usize = 2048;

/// Owns the transport for the duration of the handshake, frames
/// outgoing messages, reassembles incoming ones, and drives the state
/// machine forward.
pub struct HandshakeConnection {
    transport: Option<Box<dyn RawTransport>>,
    context: HandshakeContext,
    framer: MessageFramer,
    out_buf: Vec<u8>,
    status: Option<HandshakeError>,
}

impl HandshakeConnection {
    pub fn new(transport: Box<dyn RawTransport>, context: HandshakeContext) -> Self {
        Self {
            transport: Some(transport),
            context,
            framer: MessageFramer::default(),
            out_buf: Vec::new(),
            status: None,
        }
    }

    /// Readiness source of the owned transport, while still owned.
    pub fn source_id(&self) -> Option<SourceId> {
        self.transport.as_ref().map(|t| t.source_id())
    }

    /// The first terminal error observed by `flush`, if any.
    pub fn status(&self) -> Option<&HandshakeError> {
        self.status.as_ref()
    }

    /// Move the transport out. Returns `None` on any later call; a
    /// second extraction attempt is detectable, not undefined.
    pub fn release_transport(&mut self) -> Option<Box<dyn RawTransport>> {
        self.transport.take()
    }

    /// Exchange as many bytes as the transport allows without blocking.
    ///
    /// Returns whether the handshake is now ready to finish. The first
    /// error is also stored for the actor to consult after the
    /// transport is gone.
    pub fn flush(&mut self, handshake: &mut AuthKeyHandshake) -> Result<bool, HandshakeError> {
        let result = self.flush_inner(handshake);
        if let Err(ref err) = result {
            if self.status.is_none() {
                self.status = Some(err.clone());
            }
        }
        result
    }

    fn flush_inner(&mut self, handshake: &mut AuthKeyHandshake) -> Result<bool, HandshakeError> {
        debug_assert!(self.transport.is_some(), "flush after release_transport");
        let transport = self.transport.as_mut().ok_or_else(|| {
            HandshakeError::from(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport already released",
            ))
        })?;

        // Drain what the transport has, up to the per-call budget.
        let mut chunk = [0u8; READ_CHUNK];
        let mut drained = 0;
        while drained < READ_BUDGET {
            match transport.read_available(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    )
                    .into());
                }
                Ok(n) => {
                    drained += n;
                    self.framer
                        .ingest_bytes(&chunk[..n])
                        .map_err(|_| ProtocolError::BadMessage)?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        // Apply every fully reassembled message.
        while let Some(frame) = self.framer.pop_message() {
            let message = Message::decode(&frame)?;
            trace!(kind = message.kind(), "applying incoming message");
            handshake.apply_incoming(message, &mut self.context)?;
        }

        // Frame whatever the state machine wants to send.
        while let Some(message) = handshake.next_outgoing() {
            trace!(kind = message.kind(), "framing outgoing message");
            MessageFramer::write_frame(&mut self.out_buf, &message.encode())
                .map_err(|_| ProtocolError::BadMessage)?;
        }

        // Write as much as the transport accepts; leftovers wait for
        // the next readiness event.
        while !self.out_buf.is_empty() {
            match transport.write_available(&self.out_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.out_buf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(handshake.is_ready_for_finish())
    }
}
