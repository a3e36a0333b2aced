use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use mqtt_packet::{PacketId, SubscribeReturnCode, Type};

use crate::error::Failure;

/// The payload an acknowledgment carries back to a pending completion.
pub enum CompletionArg {
    /// PUBACK, PUBCOMP, UNSUBACK -- nothing beyond "it happened".
    Unit,
    /// SUBACK's per-filter grant/failure list.
    Granted(Vec<SubscribeReturnCode>),
}

/// The continuation stashed alongside a request still awaiting its
/// acknowledgment.
///
/// A sum type rather than one boxed `FnOnce(CompletionArg)` -- the argument
/// a PUBACK vs. a SUBACK carries is genuinely different, and matching it out
/// here at the one place a completion is ever invoked means nothing downstream
/// has to narrow a generic argument back to the type it already knows.
pub enum Completion {
    Publish(Box<dyn FnOnce(Result<(), Failure>)>),
    Subscribe(Box<dyn FnOnce(Result<Vec<SubscribeReturnCode>, Failure>)>),
    Unsubscribe(Box<dyn FnOnce(Result<(), Failure>)>),
    Disconnect(Box<dyn FnOnce(Result<(), Failure>)>),
}

impl Completion {
    /// Invokes the continuation with the ack's payload.
    ///
    /// Callers must not hold the connection's `RefCell` borrow across this
    /// call: the continuation is embedder code, and it may turn around and
    /// call straight back into the public API.
    pub fn succeed(self, arg: CompletionArg) {
        match (self, arg) {
            (Completion::Publish(cb), CompletionArg::Unit) => cb(Ok(())),
            (Completion::Unsubscribe(cb), CompletionArg::Unit) => cb(Ok(())),
            (Completion::Disconnect(cb), CompletionArg::Unit) => cb(Ok(())),
            (Completion::Subscribe(cb), CompletionArg::Granted(status)) => cb(Ok(status)),
            (completion, _) => {
                debug_assert!(false, "completion kind does not match ack payload");
                completion.fail(Failure::protocol("malformed acknowledgment"));
            }
        }
    }

    /// Invokes the continuation with a terminal failure.
    pub fn fail(self, failure: Failure) {
        match self {
            Completion::Publish(cb) => cb(Err(failure)),
            Completion::Subscribe(cb) => cb(Err(failure)),
            Completion::Unsubscribe(cb) => cb(Err(failure)),
            Completion::Disconnect(cb) => cb(Err(failure)),
        }
    }
}

/// A request still waiting for its server-side acknowledgment.
pub struct Request {
    pub frame: Bytes,
    pub packet_type: Type,
    pub completion: Option<Completion>,
}

/// Tracks requests awaiting acknowledgment, and inbound QoS 2 message ids
/// already delivered to the listener (so a retransmitted PUBLISH isn't
/// delivered twice while its PUBREL is still in flight).
#[derive(Default)]
pub struct InFlightTable {
    requests: HashMap<PacketId, Request>,
    processed: HashSet<PacketId>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.requests.contains_key(&id)
    }

    /// Records a new outstanding request. The allocator guarantees `id` is
    /// not already outstanding (I1); a debug build catches a violation of
    /// that invariant instead of silently clobbering the earlier request.
    pub fn insert(&mut self, id: PacketId, request: Request) {
        debug_assert!(
            !self.requests.contains_key(&id),
            "packet id {} already has an outstanding request",
            id
        );
        self.requests.insert(id, request);
    }

    /// Removes the request for `id` and hands its completion back to the
    /// caller to invoke (outside any borrow the caller may be holding).
    ///
    /// An ack for an id with no outstanding request is the peer's mistake,
    /// not ours -- reported as a protocol failure rather than asserted on,
    /// since it arrives over the wire and can't be ruled out by construction.
    #[must_use]
    pub fn complete(&mut self, id: PacketId, expected: Type) -> Result<Option<Completion>, Failure> {
        match self.requests.remove(&id) {
            Some(request) => {
                debug_assert_eq!(
                    request.packet_type, expected,
                    "id {} was allocated for a {:?}, acked as a {:?}",
                    id, request.packet_type, expected
                );
                Ok(request.completion)
            }
            None => Err(Failure::protocol(format!(
                "invalid message id {} from server",
                id
            ))),
        }
    }

    pub fn is_processed(&self, id: PacketId) -> bool {
        self.processed.contains(&id)
    }

    pub fn mark_processed(&mut self, id: PacketId) {
        self.processed.insert(id);
    }

    pub fn clear_processed(&mut self, id: PacketId) {
        self.processed.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drops every outstanding request and processed-id record, returning
    /// the completions so the caller can fail them with the terminal
    /// failure (I3: in-flight state does not outlive the connection).
    pub fn take_all(&mut self) -> Vec<Completion> {
        self.processed.clear();
        self.requests
            .drain()
            .filter_map(|(_, request)| request.completion)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn request(packet_type: Type, completion: Completion) -> Request {
        Request {
            frame: Bytes::new(),
            packet_type,
            completion: Some(completion),
        }
    }

    #[test]
    fn completes_publish_ack_with_matching_type() {
        let mut table = InFlightTable::new();
        let result = Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);

        table.insert(
            1,
            request(
                Type::PUBLISH,
                Completion::Publish(Box::new(move |res| *result2.borrow_mut() = Some(res))),
            ),
        );

        let completion = table.complete(1, Type::PUBLISH).unwrap().unwrap();
        completion.succeed(CompletionArg::Unit);
        assert!(match *result.borrow() {
            Some(Ok(())) => true,
            _ => false,
        });
        assert!(!table.contains(1));
    }

    #[test]
    fn completes_subscribe_with_granted_status() {
        let mut table = InFlightTable::new();
        let result = Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);

        table.insert(
            5,
            request(
                Type::SUBSCRIBE,
                Completion::Subscribe(Box::new(move |res| *result2.borrow_mut() = Some(res))),
            ),
        );

        let status = vec![SubscribeReturnCode::Success(mqtt_packet::QoS::AtLeastOnce)];
        let completion = table.complete(5, Type::SUBSCRIBE).unwrap().unwrap();
        completion.succeed(CompletionArg::Granted(status.clone()));

        match result.borrow_mut().take() {
            Some(Ok(got)) => assert_eq!(got, status),
            other => panic!("unexpected result: {:?}", other.is_some()),
        }
    }

    #[test]
    fn unknown_id_is_a_protocol_failure() {
        let mut table = InFlightTable::new();
        let err = table.complete(42, Type::PUBACK).unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn take_all_drains_requests_and_processed_ids() {
        let mut table = InFlightTable::new();
        let failed = Rc::new(RefCell::new(0));
        let failed2 = Rc::clone(&failed);

        table.insert(
            1,
            request(
                Type::PUBLISH,
                Completion::Publish(Box::new(move |res| {
                    assert!(res.is_err());
                    *failed2.borrow_mut() += 1;
                })),
            ),
        );
        table.mark_processed(9);

        let pending = table.take_all();
        assert_eq!(pending.len(), 1);
        for completion in pending {
            completion.fail(Failure::protocol("connection failed"));
        }

        assert_eq!(*failed.borrow(), 1);
        assert!(table.is_empty());
        assert!(!table.is_processed(9));
    }
}
