//! The scheduling unit that drives one handshake attempt to a single
//! terminal outcome.
//!
//! The actor never blocks and performs bounded work per invocation: the
//! external reactor calls [`HandshakeActor::on_event`] on readiness and
//! timeout, strictly serially, and the actor yields between calls.
//! Whatever happens — success, protocol or transport failure, deadline,
//! cancellation — `finish` runs exactly once, settles both result
//! channels, and leaves the actor `Stopped`.

use std::time::{Duration, Instant};

use authkex_handshake::AuthKeyHandshake;
use tracing::{debug, trace};

use crate::connection::HandshakeConnection;
use crate::error::HandshakeError;
use crate::result::ResultChannel;
use crate::transport::{RawTransport, SourceId};

/// A scheduling event delivered by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The transport may have bytes to read or room to write.
    Ready,
    /// The armed deadline elapsed.
    Timeout,
}

/// Handle for a readiness subscription, returned by the reactor and
/// revoked on unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(pub u64);

/// The external scheduler: readiness detection and the clock live here.
///
/// Implementations must deliver events for one actor strictly serially
/// and should deliver an initial readiness event right after
/// subscription (edge-triggered reactors do), which triggers the
/// actor's first write.
pub trait Reactor {
    /// Start watching `source`; events arrive via `on_event`.
    fn subscribe(&mut self, source: SourceId) -> Registration;

    /// Stop watching. The handle is dead afterwards.
    fn unsubscribe(&mut self, registration: Registration);

    /// Arm the one-shot deadline for this actor.
    fn arm_deadline(&mut self, deadline: Instant);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Finishing,
    Stopped,
}

/// Drives one handshake attempt over an owned connection and delivers
/// the outcome through two fire-once channels: the transport (for
/// reuse) and the state machine (for the derived key).
pub struct HandshakeActor {
    handshake: Option<AuthKeyHandshake>,
    connection: HandshakeConnection,
    timeout: Duration,
    lifecycle: Lifecycle,
    registration: Option<Registration>,
    transport_result: ResultChannel<Box<dyn RawTransport>>,
    handshake_result: ResultChannel<AuthKeyHandshake>,
}

impl HandshakeActor {
    pub fn new(
        handshake: AuthKeyHandshake,
        connection: HandshakeConnection,
        timeout: Duration,
        transport_result: ResultChannel<Box<dyn RawTransport>>,
        handshake_result: ResultChannel<AuthKeyHandshake>,
    ) -> Self {
        Self {
            handshake: Some(handshake),
            connection,
            timeout,
            lifecycle: Lifecycle::Running,
            registration: None,
            transport_result,
            handshake_result,
        }
    }

    /// Whether the actor reached its terminal state.
    pub fn is_stopped(&self) -> bool {
        self.lifecycle == Lifecycle::Stopped
    }

    /// Register with the reactor and arm the deadline. Performs no I/O;
    /// the first flush happens on the first readiness event.
    pub fn start_up(&mut self, reactor: &mut dyn Reactor) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Running);
        if let Some(source) = self.connection.source_id() {
            self.registration = Some(reactor.subscribe(source));
        }
        reactor.arm_deadline(Instant::now() + self.timeout);
        trace!(timeout = ?self.timeout, "handshake actor started");
    }

    /// Handle one scheduling event. Ignored outside `Running`.
    pub fn on_event(&mut self, event: Event, reactor: &mut dyn Reactor) {
        if self.lifecycle != Lifecycle::Running {
            trace!(?event, "event after finish ignored");
            return;
        }
        match event {
            Event::Timeout => {
                debug!("handshake deadline elapsed");
                self.finish(Err(HandshakeError::Timeout), reactor);
            }
            Event::Ready => {
                let Some(handshake) = self.handshake.as_mut() else {
                    return;
                };
                match self.connection.flush(handshake) {
                    Err(err) => {
                        debug!(%err, "handshake failed");
                        self.finish(Err(err), reactor);
                    }
                    Ok(true) => {
                        debug!("handshake confirmed");
                        self.finish(Ok(()), reactor);
                    }
                    Ok(false) => {}
                }
            }
        }
    }

    /// Cancel from outside. Callable at any time before `Stopped`;
    /// repeated calls are no-ops.
    pub fn close(&mut self, reactor: &mut dyn Reactor) {
        self.finish(Err(HandshakeError::Cancelled), reactor);
    }

    /// The single terminal transition. Guarded by the lifecycle so a
    /// second invocation — double cancel, readiness after timeout —
    /// cannot settle a channel twice.
    fn finish(&mut self, result: Result<(), HandshakeError>, reactor: &mut dyn Reactor) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        self.lifecycle = Lifecycle::Finishing;

        if let Some(registration) = self.registration.take() {
            reactor.unsubscribe(registration);
        }
        self.return_transport(&result);
        self.return_handshake(result);
        self.lifecycle = Lifecycle::Stopped;
    }

    fn return_transport(&mut self, result: &Result<(), HandshakeError>) {
        let Some(mut transport) = self.connection.release_transport() else {
            // Transport already gone; all that is left to deliver is the
            // connection's stored terminal status.
            let status = self
                .connection
                .status()
                .cloned()
                .unwrap_or(HandshakeError::Cancelled);
            self.transport_result.settle(Err(status));
            return;
        };

        if self.transport_result.has_recipient() {
            match result {
                Ok(()) => {
                    if let Some(stats) = transport.stats() {
                        stats.on_progress();
                    }
                    self.transport_result.settle(Ok(transport));
                }
                Err(err) => {
                    if let Some(stats) = transport.stats() {
                        stats.on_error();
                    }
                    transport.close();
                    self.transport_result.settle(Err(err.clone()));
                }
            }
        } else {
            // Unclaimed transport: close it outright. Its observer sees
            // an error since the connection is being abandoned.
            if let Some(stats) = transport.stats() {
                stats.on_error();
            }
            transport.close();
        }
    }

    fn return_handshake(&mut self, result: Result<(), HandshakeError>) {
        let handshake = self.handshake.take();
        match result {
            Ok(()) => match handshake {
                Some(handshake) => {
                    self.handshake_result.settle(Ok(handshake));
                }
                None => {
                    self.handshake_result.settle(Err(HandshakeError::Cancelled));
                }
            },
            Err(err) => {
                self.handshake_result.settle(Err(err));
            }
        }
    }
}
