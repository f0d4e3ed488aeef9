#![deny(unsafe_code)]

//! # authkex-actor
//!
//! Transport adapter and scheduling actor for the authkex handshake.
//!
//! [`HandshakeConnection`] owns a non-blocking byte-stream transport and
//! bridges it to the sans-IO state machine from `authkex-handshake`:
//! framing outgoing messages, reassembling incoming ones, and making
//! bounded progress per call. [`HandshakeActor`] is the scheduling unit
//! an external reactor drives with readiness and timeout events; it
//! detects the terminal condition and delivers the outcome exactly once
//! through two one-shot channels — the transport, for reuse, and the
//! state machine, for its derived key.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use authkex_actor::{HandshakeActor, HandshakeConnection, ResultChannel};
//! use authkex_handshake::{AuthKeyHandshake, HandshakeContext};
//!
//! fn spawn(mut context: HandshakeContext, transport: Box<dyn authkex_actor::RawTransport>) {
//!     let handshake = AuthKeyHandshake::new(&mut context);
//!     let connection = HandshakeConnection::new(transport, context);
//!     let (key_result, key_rx) = ResultChannel::pair();
//!     let mut actor = HandshakeActor::new(
//!         handshake,
//!         connection,
//!         Duration::from_secs(10),
//!         ResultChannel::absent(), // transport discarded on completion
//!         key_result,
//!     );
//!     // actor.start_up(&mut reactor); then deliver events until stopped.
//!     # let _ = (key_rx, &mut actor);
//! }
//! ```

pub mod actor;
pub mod connection;
pub mod error;
pub mod framing;
pub mod result;
pub mod transport;

pub use actor::{Event, HandshakeActor, Reactor, Registration};
pub use connection::HandshakeConnection;
pub use error::HandshakeError;
pub use framing::MessageFramer;
pub use result::ResultChannel;
pub use transport::{RawTransport, SourceId, TransportStats};
