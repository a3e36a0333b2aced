use bytes::Bytes;

/// The non-blocking, already-connected transport the engine is layered on.
///
/// Establishing the TCP/TLS/WebSocket connection and running the
/// CONNECT/CONNACK handshake happen before a transport ever reaches
/// [`ConnectionCore`](crate::ConnectionCore) -- by the time the engine sees
/// one, it only ever hands it already-encoded frames and toggles its read
/// side.
pub trait Transport {
    /// Offers an encoded frame to the transport. Non-blocking: returns
    /// `false` if the transport's own buffer is full and the frame was
    /// refused -- the caller is responsible for queuing it.
    fn offer(&mut self, frame: Bytes) -> bool;

    /// Whether `offer` would currently refuse a frame.
    fn full(&self) -> bool;

    /// Resumes delivering inbound frames to the engine.
    fn resume_read(&mut self);

    /// Pauses delivering inbound frames to the engine.
    fn suspend_read(&mut self);

    /// Tears the transport down. `on_stopped` fires once, when the teardown
    /// completes -- implementations must not call it before `stop` itself
    /// returns (defer it to the next turn of the embedder's reactor, even
    /// if teardown is instantaneous). The engine may still be mid-call when
    /// `stop` is invoked and does not hold any of its own borrows across
    /// the call, but a synchronous `on_stopped` would reenter it from
    /// inside that same call frame.
    fn stop(&mut self, on_stopped: Box<dyn FnOnce()>);
}
