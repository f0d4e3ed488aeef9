//! End-to-end scenarios for the handshake actor: an in-memory transport,
//! a manually driven reactor, and the scripted server half from
//! `authkex_handshake::testing` on the far side of the byte stream.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use authkex_actor::{
    Event, HandshakeActor, HandshakeConnection, HandshakeError, MessageFramer, RawTransport,
    Reactor, Registration, ResultChannel, SourceId, TransportStats,
};
use authkex_handshake::messages::Message;
use authkex_handshake::testing::{test_context, ScriptedServer};
use authkex_handshake::{AuthKeyHandshake, Error as ProtocolError};
use tokio::sync::oneshot;

// =========================================================================
// In-memory transport
// =========================================================================

#[derive(Default)]
struct StatsRecorder {
    errors: Cell<usize>,
    progresses: Cell<usize>,
}

impl TransportStats for StatsRecorder {
    fn on_error(&self) {
        self.errors.set(self.errors.get() + 1);
    }

    fn on_progress(&self) {
        self.progresses.set(self.progresses.get() + 1);
    }
}

#[derive(Default)]
struct MockInner {
    /// Bytes the server has queued for the client.
    read_queue: VecDeque<u8>,
    /// Bytes the client wrote, pending server pickup.
    outbox: Vec<u8>,
    /// Cumulative count of bytes the client ever wrote.
    total_written: usize,
    /// Remaining bytes the transport accepts before `WouldBlock`.
    /// `None` means unlimited.
    write_budget: Option<usize>,
    closed: bool,
    peer_closed: bool,
}

struct MockTransport {
    inner: Rc<RefCell<MockInner>>,
    stats: Rc<StatsRecorder>,
    id: u64,
}

impl RawTransport for MockTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_queue.is_empty() {
            if inner.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(inner.read_queue.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.read_queue.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write_available(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let cap = inner.write_budget.unwrap_or(usize::MAX);
        let n = data.len().min(cap);
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if let Some(budget) = inner.write_budget.as_mut() {
            *budget -= n;
        }
        inner.outbox.extend_from_slice(&data[..n]);
        inner.total_written += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.inner.borrow_mut().closed = true;
    }

    fn source_id(&self) -> SourceId {
        SourceId(self.id)
    }

    fn stats(&self) -> Option<&dyn TransportStats> {
        Some(self.stats.as_ref())
    }
}

// =========================================================================
// Manually driven reactor
// =========================================================================

#[derive(Default)]
struct ManualReactor {
    next_id: u64,
    active: Vec<Registration>,
    deadline: Option<Instant>,
}

impl Reactor for ManualReactor {
    fn subscribe(&mut self, _source: SourceId) -> Registration {
        self.next_id += 1;
        let registration = Registration(self.next_id);
        self.active.push(registration);
        registration
    }

    fn unsubscribe(&mut self, registration: Registration) {
        self.active.retain(|r| *r != registration);
    }

    fn arm_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
}

// =========================================================================
// Server side of the byte stream
// =========================================================================

/// Feeds client-written bytes to the scripted server and queues its
/// (optionally tampered) replies back onto the transport.
struct ServerPump {
    server: ScriptedServer,
    inner: Rc<RefCell<MockInner>>,
    framer: MessageFramer,
    handled: usize,
    tamper: Option<Box<dyn FnMut(Message) -> Message>>,
}

impl ServerPump {
    fn pump(&mut self) {
        let outbox = std::mem::take(&mut self.inner.borrow_mut().outbox);
        if !outbox.is_empty() {
            self.framer
                .ingest_bytes(&outbox)
                .expect("client frames should be well-formed");
        }
        while let Some(frame) = self.framer.pop_message() {
            let message = Message::decode(&frame).expect("client messages should decode");
            let mut reply = self.server.respond(&message);
            if let Some(tamper) = self.tamper.as_mut() {
                reply = tamper(reply);
            }
            self.handled += 1;

            let mut framed = Vec::new();
            MessageFramer::write_frame(&mut framed, &reply.encode())
                .expect("server replies should frame");
            self.inner.borrow_mut().read_queue.extend(framed);
        }
    }
}

// =========================================================================
// Fixture
// =========================================================================

type TransportRx = oneshot::Receiver<Result<Box<dyn RawTransport>, HandshakeError>>;
type HandshakeRx = oneshot::Receiver<Result<AuthKeyHandshake, HandshakeError>>;

struct Fixture {
    actor: HandshakeActor,
    reactor: ManualReactor,
    pump: ServerPump,
    inner: Rc<RefCell<MockInner>>,
    stats: Rc<StatsRecorder>,
    transport_rx: Option<TransportRx>,
    handshake_rx: HandshakeRx,
}

fn fixture(timeout: Duration, claim_transport: bool) -> Fixture {
    let (mut context, server) = test_context();
    let handshake = AuthKeyHandshake::new(&mut context);

    let inner = Rc::new(RefCell::new(MockInner::default()));
    let stats = Rc::new(StatsRecorder::default());
    let transport = MockTransport {
        inner: Rc::clone(&inner),
        stats: Rc::clone(&stats),
        id: 1,
    };
    let connection = HandshakeConnection::new(Box::new(transport), context);

    let (transport_result, transport_rx) = if claim_transport {
        let (tx, rx) = ResultChannel::pair();
        (tx, Some(rx))
    } else {
        (ResultChannel::absent(), None)
    };
    let (handshake_result, handshake_rx) = ResultChannel::pair();

    let actor = HandshakeActor::new(
        handshake,
        connection,
        timeout,
        transport_result,
        handshake_result,
    );

    Fixture {
        actor,
        reactor: ManualReactor::default(),
        pump: ServerPump {
            server,
            inner: Rc::clone(&inner),
            framer: MessageFramer::default(),
            handled: 0,
            tamper: None,
        },
        inner,
        stats,
        transport_rx,
        handshake_rx,
    }
}

/// Alternate readiness events with server turns until the actor stops.
fn drive(fixture: &mut Fixture, max_events: usize) {
    for _ in 0..max_events {
        if fixture.actor.is_stopped() {
            return;
        }
        fixture.actor.on_event(Event::Ready, &mut fixture.reactor);
        fixture.pump.pump();
    }
}

// =========================================================================
// Scenario 1: happy path
// =========================================================================

#[test]
fn happy_path_delivers_key_and_transport() {
    let mut fx = fixture(Duration::from_secs(5), true);

    fx.actor.start_up(&mut fx.reactor);
    assert_eq!(fx.reactor.active.len(), 1);
    assert!(fx.reactor.deadline.is_some());

    drive(&mut fx, 10);
    assert!(fx.actor.is_stopped());
    // Three requests answered: six messages total, in stage order.
    assert_eq!(fx.pump.handled, 3);

    let mut handshake = fx
        .handshake_rx
        .try_recv()
        .expect("state-machine channel settled")
        .expect("handshake succeeded");
    let key = handshake.take_derived_key().expect("key present");
    assert!(!key.key().is_empty());
    assert_eq!(key.key(), fx.pump.server.derived_key());

    let transport = fx
        .transport_rx
        .take()
        .expect("fixture registered a recipient")
        .try_recv()
        .expect("transport channel settled")
        .expect("transport returned with success tag");
    assert_eq!(transport.source_id(), SourceId(1));
    assert!(!fx.inner.borrow().closed, "reusable transport stays open");

    assert_eq!(fx.stats.progresses.get(), 1);
    assert_eq!(fx.stats.errors.get(), 0);
    assert!(fx.reactor.active.is_empty(), "subscription revoked");
}

#[test]
fn trickle_writes_still_complete() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.inner.borrow_mut().write_budget = Some(0);

    fx.actor.start_up(&mut fx.reactor);
    for _ in 0..120 {
        if fx.actor.is_stopped() {
            break;
        }
        // The transport accepts a few bytes per readiness event, so
        // every outgoing message is split across several flushes.
        fx.inner.borrow_mut().write_budget = Some(16);
        fx.actor.on_event(Event::Ready, &mut fx.reactor);
        fx.pump.pump();
    }

    assert!(fx.actor.is_stopped());
    let mut handshake = fx.handshake_rx.try_recv().unwrap().unwrap();
    assert!(handshake.take_derived_key().is_some());
}

// =========================================================================
// Scenario 2: tampered nonce echo
// =========================================================================

#[test]
fn tampered_server_nonce_fails_both_channels() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.pump.tamper = Some(Box::new(|mut reply| {
        if let Message::DhParamsResponse(ref mut m) = reply {
            // Echo a server nonce different from the one advertised in
            // the PQ response.
            m.server_nonce[0] ^= 0x01;
        }
        reply
    }));

    fx.actor.start_up(&mut fx.reactor);
    drive(&mut fx, 10);
    assert!(fx.actor.is_stopped());

    let handshake_err = fx
        .handshake_rx
        .try_recv()
        .expect("state-machine channel settled")
        .expect_err("nonce mismatch is terminal");
    assert!(matches!(
        handshake_err,
        HandshakeError::Protocol(ProtocolError::NonceMismatch)
    ));

    let transport_err = fx
        .transport_rx
        .take()
        .unwrap()
        .try_recv()
        .expect("transport channel settled")
        .expect_err("transport tagged with the error");
    assert!(matches!(
        transport_err,
        HandshakeError::Protocol(ProtocolError::NonceMismatch)
    ));

    assert!(fx.inner.borrow().closed, "failed transport is closed");
    assert_eq!(fx.stats.errors.get(), 1);
    assert_eq!(fx.stats.progresses.get(), 0);
}

// =========================================================================
// Scenario 3: cancellation mid-handshake
// =========================================================================

#[test]
fn close_mid_handshake_cancels_and_stops_io() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.actor.start_up(&mut fx.reactor);

    // Two readiness rounds: the PQ request goes out and is answered,
    // then the DH-params request goes out.
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    fx.pump.pump();
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    fx.pump.pump();
    assert_eq!(fx.pump.handled, 2);

    let written_before = fx.inner.borrow().total_written;
    fx.actor.close(&mut fx.reactor);
    assert!(fx.actor.is_stopped());

    assert!(matches!(
        fx.handshake_rx.try_recv().unwrap(),
        Err(HandshakeError::Cancelled)
    ));
    assert!(matches!(
        fx.transport_rx.take().unwrap().try_recv().unwrap(),
        Err(HandshakeError::Cancelled)
    ));
    assert!(fx.inner.borrow().closed);
    assert!(fx.reactor.active.is_empty());

    // Late readiness events are ignored and write nothing.
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    assert_eq!(fx.inner.borrow().total_written, written_before);
}

#[test]
fn double_close_settles_each_channel_once() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.actor.start_up(&mut fx.reactor);
    fx.actor.on_event(Event::Ready, &mut fx.reactor);

    fx.actor.close(&mut fx.reactor);
    fx.actor.close(&mut fx.reactor);
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    assert!(fx.actor.is_stopped());

    // Exactly one value on each channel.
    assert!(matches!(
        fx.handshake_rx.try_recv().unwrap(),
        Err(HandshakeError::Cancelled)
    ));
    assert!(matches!(
        fx.transport_rx.take().unwrap().try_recv().unwrap(),
        Err(HandshakeError::Cancelled)
    ));
}

// =========================================================================
// Scenario 4: deadline
// =========================================================================

#[test]
fn zero_deadline_times_out_before_any_write() {
    let mut fx = fixture(Duration::ZERO, false);
    fx.actor.start_up(&mut fx.reactor);

    // The scheduler's timeout tick fires before any readiness event.
    fx.actor.on_event(Event::Timeout, &mut fx.reactor);
    assert!(fx.actor.is_stopped());
    assert_eq!(fx.inner.borrow().total_written, 0, "no message was sent");

    assert!(matches!(
        fx.handshake_rx.try_recv().unwrap(),
        Err(HandshakeError::Timeout)
    ));
    // No transport recipient: closed outright.
    assert!(fx.inner.borrow().closed);
    assert_eq!(fx.stats.errors.get(), 1);
}

#[test]
fn timeout_mid_handshake_yields_timeout_and_closed_transport() {
    let mut fx = fixture(Duration::from_millis(50), true);
    fx.actor.start_up(&mut fx.reactor);
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    fx.pump.pump();

    fx.actor.on_event(Event::Timeout, &mut fx.reactor);
    assert!(fx.actor.is_stopped());

    assert!(matches!(
        fx.handshake_rx.try_recv().unwrap(),
        Err(HandshakeError::Timeout)
    ));
    assert!(matches!(
        fx.transport_rx.take().unwrap().try_recv().unwrap(),
        Err(HandshakeError::Timeout)
    ));
    assert!(fx.inner.borrow().closed);
}

#[test]
fn timeout_after_confirmation_is_ignored() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.actor.start_up(&mut fx.reactor);
    drive(&mut fx, 10);
    assert!(fx.actor.is_stopped());

    // A stale timeout tick after the terminal transition changes nothing.
    fx.actor.on_event(Event::Timeout, &mut fx.reactor);

    assert!(fx.handshake_rx.try_recv().unwrap().is_ok());
    assert!(fx.transport_rx.take().unwrap().try_recv().unwrap().is_ok());
}

// =========================================================================
// Unclaimed resources
// =========================================================================

#[test]
fn unclaimed_transport_is_closed_even_on_success() {
    let mut fx = fixture(Duration::from_secs(5), false);
    fx.actor.start_up(&mut fx.reactor);
    drive(&mut fx, 10);
    assert!(fx.actor.is_stopped());

    assert!(fx.handshake_rx.try_recv().unwrap().is_ok());
    assert!(
        fx.inner.borrow().closed,
        "transport with no recipient is closed, not leaked"
    );
}

// =========================================================================
// Transport failure
// =========================================================================

#[test]
fn peer_close_is_a_transport_error() {
    let mut fx = fixture(Duration::from_secs(5), true);
    fx.actor.start_up(&mut fx.reactor);
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    fx.pump.pump();

    // The server vanishes: drained queue + peer_closed makes the next
    // read return Ok(0).
    {
        let mut inner = fx.inner.borrow_mut();
        inner.read_queue.clear();
        inner.peer_closed = true;
    }
    fx.actor.on_event(Event::Ready, &mut fx.reactor);
    assert!(fx.actor.is_stopped());

    assert!(matches!(
        fx.handshake_rx.try_recv().unwrap(),
        Err(HandshakeError::Transport(_))
    ));
    assert!(fx.inner.borrow().closed);
    assert_eq!(fx.stats.errors.get(), 1);
}
