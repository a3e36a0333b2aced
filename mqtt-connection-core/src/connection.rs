use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mqtt_packet::{Packet, PacketId, Publish, QoS, SubscribeReturnCode, Type};

use crate::encode;
use crate::error::Failure;
use crate::heartbeat::{HeartbeatController, HeartbeatEvent};
use crate::id::MessageIdAllocator;
use crate::inflight::{Completion, CompletionArg, InFlightTable, Request};
use crate::outbound::OutboundQueue;
use crate::panic_sink::{self, FaultSink};
use crate::transport::Transport;

/// Receives inbound application messages and the connection's terminal
/// failure, if any.
pub trait Listener {
    /// An application message arrived. `ack` must be completed once the
    /// listener is done with the message -- for QoS 1/2 that is what
    /// actually sends the PUBACK/PUBREC back to the peer.
    fn deliver(&mut self, topic: &str, payload: &[u8], ack: AckCompletion);

    /// The connection has failed terminally; no further messages will be
    /// delivered and no further writes will succeed.
    fn failure(&mut self, failure: &Failure);
}

/// Acknowledges an inbound message once the listener is done processing it.
///
/// QoS 0 carries no acknowledgment: completing it is a no-op. QoS 1 sends
/// the PUBACK. QoS 2 marks the message processed (so a retransmit of the
/// same PUBLISH is not redelivered) and then sends the PUBREC -- in that
/// order, so a listener that panics mid-delivery (caught by the fault sink)
/// never leaves an id marked processed without the peer having been told.
pub struct AckCompletion(Box<dyn FnOnce()>);

impl AckCompletion {
    pub fn complete(self) {
        (self.0)()
    }
}

struct Inner<T: Transport> {
    transport: T,
    connected: bool,
    failure: Option<Failure>,
    ids: MessageIdAllocator,
    outbound: OutboundQueue,
    inflight: InFlightTable,
    heartbeat: HeartbeatController,
    listener: Option<Box<dyn Listener>>,
    refiller: Option<Box<dyn FnMut()>>,
    pending_stop: Option<Completion>,
    stop_started: bool,
    fault_sink: Rc<FaultSink>,
}

/// A single-threaded MQTT client connection: QoS 0/1/2 handshakes, message
/// id bookkeeping, flow-control backpressure and keep-alive, layered over an
/// already-connected [`Transport`].
///
/// Establishing the transport and running CONNECT/CONNACK happen before a
/// [`Transport`] ever reaches this type -- see the crate docs.
///
/// Cheap to [`Clone`]; every clone shares the same state. Every public
/// method must be called from the thread that created the connection --
/// methods that take a completion deliver a [`Failure::Usage`] to it
/// synchronously if called from elsewhere; the rest debug-assert instead,
/// since they have no callback to deliver one through.
pub struct ConnectionCore<T: Transport> {
    inner: Rc<RefCell<Inner<T>>>,
    owner: Rc<Cell<ThreadId>>,
}

impl<T: Transport> Clone for ConnectionCore<T> {
    fn clone(&self) -> Self {
        ConnectionCore {
            inner: Rc::clone(&self.inner),
            owner: Rc::clone(&self.owner),
        }
    }
}

impl<T: Transport> ConnectionCore<T> {
    pub fn new(transport: T, keep_alive: Duration) -> Self {
        let inner = Inner {
            transport,
            connected: true,
            failure: None,
            ids: MessageIdAllocator::new(),
            outbound: OutboundQueue::new(),
            inflight: InFlightTable::new(),
            heartbeat: HeartbeatController::new(keep_alive),
            listener: None,
            refiller: None,
            pending_stop: None,
            stop_started: false,
            fault_sink: Rc::new(panic_sink::default_fault_sink()),
        };

        let core = ConnectionCore {
            inner: Rc::new(RefCell::new(inner)),
            owner: Rc::new(Cell::new(thread::current().id())),
        };

        core.inner.borrow_mut().heartbeat.note_write();
        core
    }

    fn check_thread(&self) -> bool {
        self.owner.get() == thread::current().id()
    }

    fn assert_thread(&self) {
        debug_assert!(
            self.check_thread(),
            "ConnectionCore used from a thread other than the one that created it"
        );
    }

    /// Installs the listener that receives inbound messages and the
    /// terminal failure.
    pub fn listener(&self, listener: impl Listener + 'static) {
        self.assert_thread();
        self.inner.borrow_mut().listener = Some(Box::new(listener));
    }

    /// Installs the callback invoked once the outbound overflow queue has
    /// fully drained, so the embedder can resume feeding it more work.
    pub fn refiller(&self, refiller: impl FnMut() + 'static) {
        self.assert_thread();
        self.inner.borrow_mut().refiller = Some(Box::new(refiller));
    }

    /// Whether the outbound side is backed up -- either frames are sitting
    /// in overflow, or the transport itself is reporting full.
    pub fn full(&self) -> bool {
        self.assert_thread();
        let inner = self.inner.borrow();
        !inner.outbound.is_empty() || inner.transport.full()
    }

    /// The connection's terminal failure, if it has failed.
    pub fn failure(&self) -> Option<Failure> {
        self.assert_thread();
        self.inner.borrow().failure.clone()
    }

    /// Pauses inbound delivery and the heartbeat in lockstep (§4.5): with
    /// reads paused no PINGRESP can arrive, so the heartbeat must stop
    /// expecting one too, or a suspend outlasting the write interval fails
    /// the connection with a ping timeout nothing could ever have cleared.
    pub fn suspend(&self) {
        self.assert_thread();
        let mut inner = self.inner.borrow_mut();
        inner.transport.suspend_read();
        inner.heartbeat.suspend();
    }

    pub fn resume(&self) {
        self.assert_thread();
        let mut inner = self.inner.borrow_mut();
        inner.transport.resume_read();
        inner.heartbeat.resume();
    }

    /// Publishes a message. `cb` fires once the publish is fully
    /// acknowledged for QoS 1/2 (PUBACK/PUBCOMP), or once the frame has
    /// been handed to the transport for QoS 0 -- QoS 0 has no
    /// acknowledgment to wait for.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        cb: impl FnOnce(Result<(), Failure>) + 'static,
    ) {
        if !self.check_thread() {
            cb(Err(Failure::usage("called from the wrong execution context")));
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(failure) = inner.failure.clone() {
            drop(inner);
            cb(Err(failure));
            return;
        }

        let ready = match qos {
            QoS::AtMostOnce => {
                let frame = encode::publish(None, topic, payload, qos, retain);
                let (_, ready) = inner.outbound.push(&mut inner.transport, frame, Some(Box::new(cb)));
                ready
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let id = inner.ids.allocate();
                debug!("allocated id {} for {:?} PUBLISH {}", id, qos, topic);
                let frame = encode::publish(Some(id), topic, payload, qos, retain);
                inner.inflight.insert(
                    id,
                    Request {
                        frame: frame.clone(),
                        packet_type: Type::PUBLISH,
                        completion: Some(Completion::Publish(Box::new(cb))),
                    },
                );
                let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
                ready
            }
        };
        inner.heartbeat.note_write();
        drop(inner);

        if let Some(cb) = ready {
            cb(Ok(()));
        }
    }

    /// Subscribes to `filters`. Requires a [`Listener`] to already be
    /// installed -- there would be nowhere to deliver a matching message.
    pub fn subscribe(
        &self,
        filters: &[(&str, QoS)],
        cb: impl FnOnce(Result<Vec<SubscribeReturnCode>, Failure>) + 'static,
    ) {
        if !self.check_thread() {
            cb(Err(Failure::usage("called from the wrong execution context")));
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(failure) = inner.failure.clone() {
            drop(inner);
            cb(Err(failure));
            return;
        }
        if inner.listener.is_none() {
            drop(inner);
            cb(Err(Failure::usage("subscribe requires a listener to be installed first")));
            return;
        }

        let id = inner.ids.allocate();
        let frame = encode::subscribe(id, filters);
        inner.inflight.insert(
            id,
            Request {
                frame: frame.clone(),
                packet_type: Type::SUBSCRIBE,
                completion: Some(Completion::Subscribe(Box::new(cb))),
            },
        );
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    pub fn unsubscribe(&self, filters: &[&str], cb: impl FnOnce(Result<(), Failure>) + 'static) {
        if !self.check_thread() {
            cb(Err(Failure::usage("called from the wrong execution context")));
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(failure) = inner.failure.clone() {
            drop(inner);
            cb(Err(failure));
            return;
        }

        let id = inner.ids.allocate();
        let frame = encode::unsubscribe(id, filters);
        inner.inflight.insert(
            id,
            Request {
                frame: frame.clone(),
                packet_type: Type::UNSUBSCRIBE,
                completion: Some(Completion::Unsubscribe(Box::new(cb))),
            },
        );
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    /// Sends DISCONNECT and tears the transport down once it -- and
    /// anything still queued ahead of it -- has actually been written.
    /// `cb` fires once the transport finishes stopping.
    pub fn disconnect(&self, cb: impl FnOnce(Result<(), Failure>) + 'static) {
        if !self.check_thread() {
            cb(Err(Failure::usage("called from the wrong execution context")));
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(failure) = inner.failure.clone() {
            drop(inner);
            cb(Err(failure));
            return;
        }

        // Set synchronously, not just once `begin_stop` runs once the
        // transport has accepted the frame (§4.6) -- otherwise a DISCONNECT
        // still sitting in overflow looks "connected" to a heartbeat
        // write-interval tick in the meantime, which would queue a PINGREQ
        // behind it.
        inner.connected = false;

        let frame = encode::disconnect();
        let inner_rc = Rc::clone(&self.inner);
        let cb: Box<dyn FnOnce(Result<(), Failure>)> = Box::new(cb);
        let on_offer: Box<dyn FnOnce(Result<(), Failure>)> = Box::new(move |res| match res {
            Ok(()) => {
                let mut locked = inner_rc.borrow_mut();
                if locked.outbound.is_empty() {
                    drop(locked);
                    Self::begin_stop(&inner_rc, Some(Completion::Disconnect(cb)));
                } else {
                    locked.pending_stop = Some(Completion::Disconnect(cb));
                }
            }
            Err(failure) => cb(Err(failure)),
        });

        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, Some(on_offer));
        inner.heartbeat.note_write();
        drop(inner);

        if let Some(ready) = ready {
            ready(Ok(()));
        }
    }

    /// Called by the embedder whenever the transport reports it can accept
    /// more data -- drains anything still buffered in overflow, then either
    /// resumes a stop that was waiting on the drain or calls the refiller.
    pub fn on_writable(&self) {
        self.assert_thread();

        let mut inner = self.inner.borrow_mut();
        let (became_empty, ready) = inner.outbound.drain(&mut inner.transport);
        let pending_stop = if became_empty { inner.pending_stop.take() } else { None };
        drop(inner);

        for cb in ready {
            cb(Ok(()));
        }

        if let Some(completion) = pending_stop {
            Self::begin_stop(&self.inner, Some(completion));
        } else if became_empty {
            debug!("outbound overflow fully drained");
            self.run_refiller();
        }
    }

    fn run_refiller(&self) {
        let mut inner = self.inner.borrow_mut();
        let refiller = inner.refiller.take();
        let sink = Rc::clone(&inner.fault_sink);
        drop(inner);

        if let Some(mut refiller) = refiller {
            panic_sink::guard(&sink, || refiller());

            let mut inner = self.inner.borrow_mut();
            if inner.refiller.is_none() {
                inner.refiller = Some(refiller);
            }
        }
    }

    fn deliver(&self, topic: String, payload: Vec<u8>, ack: AckCompletion) {
        let mut inner = self.inner.borrow_mut();
        let listener = inner.listener.take();
        let sink = Rc::clone(&inner.fault_sink);
        drop(inner);

        match listener {
            Some(mut listener) => {
                panic_sink::guard(&sink, || listener.deliver(&topic, &payload, ack));

                let mut inner = self.inner.borrow_mut();
                if inner.listener.is_none() {
                    inner.listener = Some(listener);
                }
            }
            // No listener installed to hand the message to -- still
            // complete the ack so QoS 1/2 delivery keeps flowing instead of
            // stalling the peer's retransmits forever.
            None => ack.complete(),
        }
    }

    /// Feeds a decoded inbound packet to the connection. The packet never
    /// outlives this call -- anything the engine needs to keep is copied
    /// out of it before returning.
    pub fn process_frame(&self, packet: Packet<'_>) {
        self.assert_thread();
        trace!("received {:?} packet", packet.packet_type());

        match packet {
            Packet::PublishAck(ack) => self.complete_unit(ack.packet_id, Type::PUBLISH),
            Packet::PublishReceived(rec) => self.on_publish_received(rec.packet_id),
            Packet::PublishComplete(comp) => self.complete_unit(comp.packet_id, Type::PUBLISH),
            Packet::SubscribeAck(ack) => self.complete_subscribe(ack.packet_id, ack.status),
            Packet::UnsubscribeAck(ack) => self.complete_unit(ack.packet_id, Type::UNSUBSCRIBE),
            Packet::Pong => self.inner.borrow_mut().heartbeat.on_pong(),
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::PublishRelease(rel) => self.on_publish_release(rel.packet_id),
            _ => self.process_failure(Failure::protocol("unexpected inbound packet type")),
        }
    }

    fn complete_unit(&self, id: PacketId, expected: Type) {
        let mut inner = self.inner.borrow_mut();
        match inner.inflight.complete(id, expected) {
            Ok(Some(completion)) => {
                drop(inner);
                completion.succeed(CompletionArg::Unit);
            }
            Ok(None) => {}
            Err(failure) => {
                drop(inner);
                self.process_failure(failure);
            }
        }
    }

    fn complete_subscribe(&self, id: PacketId, status: Vec<SubscribeReturnCode>) {
        let mut inner = self.inner.borrow_mut();
        match inner.inflight.complete(id, Type::SUBSCRIBE) {
            Ok(Some(completion)) => {
                drop(inner);
                completion.succeed(CompletionArg::Granted(status));
            }
            Ok(None) => {}
            Err(failure) => {
                drop(inner);
                self.process_failure(failure);
            }
        }
    }

    /// QoS 2 publisher side: the peer has received our PUBLISH. Re-sending
    /// PUBREL here is idempotent -- a repeated PUBREC (the peer retrying
    /// because our PUBREL was lost) just gets another PUBREL.
    fn on_publish_received(&self, id: PacketId) {
        let mut inner = self.inner.borrow_mut();
        if !inner.inflight.contains(id) {
            drop(inner);
            self.process_failure(Failure::protocol(format!("invalid message id {} from server", id)));
            return;
        }
        let frame = encode::publish_release(id);
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    fn on_publish(&self, publish: Publish<'_>) {
        let topic = publish.topic_name.to_string();
        let payload = publish.payload.to_vec();

        match publish.qos {
            QoS::AtMostOnce => self.deliver(topic, payload, AckCompletion(Box::new(|| {}))),
            QoS::AtLeastOnce => {
                let id = publish.packet_id.expect("QoS 1 PUBLISH carries a packet id");
                let core = self.clone();
                self.deliver(
                    topic,
                    payload,
                    AckCompletion(Box::new(move || core.send_publish_ack(id))),
                );
            }
            QoS::ExactlyOnce => {
                let id = publish.packet_id.expect("QoS 2 PUBLISH carries a packet id");

                let mut inner = self.inner.borrow_mut();
                if inner.inflight.is_processed(id) {
                    warn!("duplicate QoS 2 PUBLISH id {} before PUBREL, re-sending PUBREC without redelivery", id);
                    let frame = encode::publish_received(id);
                    let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
                    inner.heartbeat.note_write();
                    drop(inner);
                    debug_assert!(ready.is_none());
                    return;
                }
                drop(inner);

                let core = self.clone();
                self.deliver(
                    topic,
                    payload,
                    AckCompletion(Box::new(move || core.mark_processed_and_ack(id))),
                );
            }
        }
    }

    fn send_publish_ack(&self, id: PacketId) {
        let mut inner = self.inner.borrow_mut();
        let frame = encode::publish_ack(id);
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    fn mark_processed_and_ack(&self, id: PacketId) {
        let mut inner = self.inner.borrow_mut();
        inner.inflight.mark_processed(id);
        let frame = encode::publish_received(id);
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    /// QoS 2 subscriber side: the peer has released the message. Whether or
    /// not it was still marked processed, PUBCOMP always goes back -- this
    /// is the peer's retry path if an earlier PUBCOMP was lost.
    fn on_publish_release(&self, id: PacketId) {
        let mut inner = self.inner.borrow_mut();
        inner.inflight.clear_processed(id);
        let frame = encode::publish_complete(id);
        let (_, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        inner.heartbeat.note_write();
        drop(inner);
        debug_assert!(ready.is_none());
    }

    /// Drains timer-thread events that arrived since the last poll and acts
    /// on them. Must be called periodically by the embedder's reactor --
    /// see `heartbeat` module docs for why the timer thread can't act on
    /// this state directly.
    pub fn poll_heartbeat(&self) {
        self.assert_thread();

        let events = self.inner.borrow().heartbeat.poll_events();
        for event in events {
            match event {
                HeartbeatEvent::WriteIntervalElapsed => self.on_write_interval_elapsed(),
                HeartbeatEvent::TimeoutCheck(at) => self.on_timeout_check(at),
            }
        }
    }

    fn on_write_interval_elapsed(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected
            || inner.failure.is_some()
            || !inner.heartbeat.is_idle()
            || inner.heartbeat.is_suspended()
        {
            return;
        }

        let frame = encode::ping();
        let (accepted, ready) = inner.outbound.push(&mut inner.transport, frame, None);
        debug_assert!(ready.is_none());

        if accepted {
            debug!("PINGREQ sent, arming keep-alive timeout");
            inner.heartbeat.arm_timeout(Instant::now());
        }
        // always re-arm the write-interval timer, whether or not the PING
        // was actually accepted -- a PING still sitting in overflow is not
        // "we wrote something recently" and must be retried next interval.
        inner.heartbeat.note_write();
    }

    fn on_timeout_check(&self, at: Instant) {
        let still_pending = self.inner.borrow().heartbeat.is_still_pending(at);
        if still_pending {
            self.process_failure(Failure::protocol("ping timeout"));
        }
    }

    /// Fails the connection terminally: every pending completion (in flight
    /// or still queued in overflow) is resolved with `failure`, the
    /// listener is told, and the transport is torn down. A no-op if the
    /// connection has already failed (first call wins).
    pub fn process_failure(&self, failure: Failure) {
        let mut inner = self.inner.borrow_mut();
        if inner.failure.is_some() {
            return;
        }
        error!("connection failed terminally: {}", failure);
        inner.failure = Some(failure.clone());
        inner.connected = false;

        let completions = inner.inflight.take_all();
        let queued = inner.outbound.take_all();
        drop(inner);

        for completion in completions {
            completion.fail(failure.clone());
        }
        for cb in queued {
            cb(Err(failure.clone()));
        }

        let listener = {
            let mut inner = self.inner.borrow_mut();
            inner.listener.take()
        };
        if let Some(mut listener) = listener {
            let sink = Rc::clone(&self.inner.borrow().fault_sink);
            panic_sink::guard(&sink, || listener.failure(&failure));

            let mut inner = self.inner.borrow_mut();
            if inner.listener.is_none() {
                inner.listener = Some(listener);
            }
        }

        Self::begin_stop(&self.inner, None);
    }

    /// Starts tearing the transport down, exactly once. `completion`, if
    /// given, is resolved once the teardown finishes; a second caller
    /// racing to stop an already-stopping connection gets its completion
    /// queued alongside the first.
    fn begin_stop(inner_rc: &Rc<RefCell<Inner<T>>>, completion: Option<Completion>) {
        let mut inner = inner_rc.borrow_mut();
        if inner.stop_started {
            if let Some(completion) = completion {
                // another caller already owns the in-flight `stop`; this
                // one just waits for the same teardown to finish.
                inner.pending_stop = Some(completion);
            }
            return;
        }
        inner.stop_started = true;
        inner.connected = false;
        drop(inner);

        let inner_rc = Rc::clone(inner_rc);
        inner_rc.borrow_mut().transport.stop(Box::new(move || {
            let pending = inner_rc.borrow_mut().pending_stop.take();
            if let Some(completion) = completion {
                completion.succeed(CompletionArg::Unit);
            }
            if let Some(completion) = pending {
                completion.succeed(CompletionArg::Unit);
            }
        }));
    }
}
