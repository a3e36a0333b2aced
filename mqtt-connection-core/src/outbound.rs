use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::Failure;
use crate::transport::Transport;

type OnOffer = Box<dyn FnOnce(Result<(), Failure>)>;

/// A frame that could not be handed to the transport immediately, plus the
/// continuation to resume once it finally is.
struct Queued {
    frame: Bytes,
    on_offer: Option<OnOffer>,
}

/// Front-of-line overflow buffer implementing the transport's backpressure
/// contract: `offer` is non-blocking and may refuse a frame, so frames that
/// don't fit are buffered here and replayed, in order, once the transport
/// signals it can accept more.
///
/// `push` and `drain` never invoke a continuation themselves -- they hand
/// ready ones back to the caller instead. The caller (`ConnectionCore`) owns
/// the `RefCell` borrow that is mutably held while this queue is touched,
/// and a continuation is embedder code that may call straight back into the
/// public API; invoking it while still borrowed would panic on reentry. The
/// caller is expected to drop its borrow before running what it gets back.
#[derive(Default)]
pub struct OutboundQueue {
    overflow: VecDeque<Queued>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty()
    }

    /// Offers `frame` to `transport`. If overflow is already empty and the
    /// transport accepts it, returns `(true, on_offer)` -- `on_offer`, if
    /// any, is ready for the caller to run (outside any borrow). Otherwise
    /// the frame (and continuation) are buffered and `(false, None)` is
    /// returned -- nothing to run now, and the caller should not treat the
    /// frame as having reached the transport yet.
    ///
    /// A direct push only ever tries the transport when overflow is already
    /// empty; once anything is queued, every later frame queues behind it
    /// too, which is what keeps outbound order equal to acceptance order (no
    /// frame may cut in front of one still waiting in overflow).
    #[must_use]
    pub fn push<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: Bytes,
        on_offer: Option<OnOffer>,
    ) -> (bool, Option<OnOffer>) {
        if self.overflow.is_empty() && transport.offer(frame.clone()) {
            (true, on_offer)
        } else {
            self.overflow.push_back(Queued { frame, on_offer });
            (false, None)
        }
    }

    /// Drains overflow into `transport`, front to back, until either it
    /// empties or the transport refuses again.
    ///
    /// Returns the continuations that became ready, in order, plus whether
    /// overflow became empty as a result -- the caller must invoke the
    /// embedder's `refiller` exactly once when that flag is set.
    #[must_use]
    pub fn drain<T: Transport>(&mut self, transport: &mut T) -> (bool, Vec<OnOffer>) {
        let mut ready = Vec::new();

        if self.overflow.is_empty() {
            return (false, ready);
        }

        while let Some(queued) = self.overflow.front() {
            if !transport.offer(queued.frame.clone()) {
                return (false, ready);
            }

            let queued = self.overflow.pop_front().expect("front just matched offer");

            if let Some(cb) = queued.on_offer {
                ready.push(cb);
            }
        }

        (true, ready)
    }

    /// Drops every queued frame and returns their continuations so the
    /// caller can fail them with the terminal failure. Used by
    /// `processFailure` (§4.7).
    #[must_use]
    pub fn take_all(&mut self) -> Vec<OnOffer> {
        self.overflow.drain(..).filter_map(|queued| queued.on_offer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTransport {
        full: bool,
        offered: Vec<Bytes>,
    }

    impl Transport for FakeTransport {
        fn offer(&mut self, frame: Bytes) -> bool {
            if self.full {
                false
            } else {
                self.offered.push(frame);
                true
            }
        }
        fn full(&self) -> bool {
            self.full
        }
        fn resume_read(&mut self) {}
        fn suspend_read(&mut self) {}
        fn stop(&mut self, on_stopped: Box<dyn FnOnce()>) {
            on_stopped();
        }
    }

    #[test]
    fn direct_push_returns_ready_continuation_when_accepted() {
        let mut transport = FakeTransport::default();
        let mut queue = OutboundQueue::new();

        let (accepted, ready) = queue.push(
            &mut transport,
            Bytes::from_static(b"m1"),
            Some(Box::new(|res| assert!(res.is_ok()))),
        );

        assert!(accepted);
        ready.unwrap()(Ok(()));
        assert!(queue.is_empty());
        assert_eq!(transport.offered, vec![Bytes::from_static(b"m1")]);
    }

    #[test]
    fn full_transport_buffers_and_drains_in_order() {
        let mut transport = FakeTransport {
            full: true,
            offered: Vec::new(),
        };
        let mut queue = OutboundQueue::new();

        for m in &["m1", "m2", "m3"] {
            let (accepted, ready) = queue.push(&mut transport, Bytes::from(m.to_string().into_bytes()), None);
            assert!(!accepted);
            assert!(ready.is_none());
        }

        assert!(!queue.is_empty());

        transport.full = false;
        let (became_empty, ready) = queue.drain(&mut transport);

        assert!(became_empty);
        assert!(ready.is_empty(), "no on_offer callbacks were attached");
        assert!(queue.is_empty());
        assert_eq!(
            transport.offered,
            vec![
                Bytes::from_static(b"m1"),
                Bytes::from_static(b"m2"),
                Bytes::from_static(b"m3"),
            ]
        );
    }

    #[test]
    fn drain_stops_at_first_refusal() {
        struct OneShot {
            allowed: usize,
            offered: usize,
        }
        impl Transport for OneShot {
            fn offer(&mut self, _frame: Bytes) -> bool {
                if self.offered < self.allowed {
                    self.offered += 1;
                    true
                } else {
                    false
                }
            }
            fn full(&self) -> bool {
                false
            }
            fn resume_read(&mut self) {}
            fn suspend_read(&mut self) {}
            fn stop(&mut self, on_stopped: Box<dyn FnOnce()>) {
                on_stopped();
            }
        }

        let mut blocked = FakeTransport {
            full: true,
            offered: Vec::new(),
        };
        let mut queue = OutboundQueue::new();
        let _ = queue.push(&mut blocked, Bytes::from_static(b"m1"), None);
        let _ = queue.push(&mut blocked, Bytes::from_static(b"m2"), None);

        let mut one_shot = OneShot {
            allowed: 1,
            offered: 0,
        };

        let (became_empty, ready) = queue.drain(&mut one_shot);
        assert!(!became_empty);
        assert_eq!(ready.len(), 0);
        assert!(!queue.is_empty(), "second frame stays queued after refusal");
    }

    #[test]
    fn take_all_returns_every_queued_continuation() {
        let mut transport = FakeTransport {
            full: true,
            offered: Vec::new(),
        };
        let mut queue = OutboundQueue::new();

        for _ in 0..2 {
            let _ = queue.push(
                &mut transport,
                Bytes::from_static(b"m"),
                Some(Box::new(|res| assert!(res.is_err()))),
            );
        }

        let pending = queue.take_all();
        assert_eq!(pending.len(), 2);
        for cb in pending {
            cb(Err(Failure::protocol("connection failed")));
        }
        assert!(queue.is_empty());
    }
}
