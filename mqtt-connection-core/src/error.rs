use std::fmt;
use std::io;

/// A terminal failure reported to the embedder.
///
/// Unlike the `anyhow::Error` the blocking clients elsewhere in this
/// workspace hand back to a caller that only wants something to print, this
/// is a closed enum: an embedder driving reconnection policy needs to match
/// on *kind* (transport died vs. the peer misbehaved vs. we were misused) to
/// decide whether retrying even makes sense. Downcasting an opaque error for
/// that is the wrong shape for a library seam.
#[derive(Debug)]
pub enum Failure {
    /// The transport reported an I/O error.
    Transport(io::Error),
    /// The remote peer (or our own bookkeeping) violated the protocol:
    /// an ack for an id we never allocated, a ping that never got a pong.
    Protocol(String),
    /// The embedder misused the public API: subscribed with no listener
    /// installed, or called in from the wrong execution context.
    Usage(String),
}

impl Failure {
    pub fn protocol(message: impl Into<String>) -> Self {
        Failure::Protocol(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Failure::Usage(message.into())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Transport(err) => write!(f, "transport failure: {}", err),
            Failure::Protocol(message) => write!(f, "protocol failure: {}", message),
            Failure::Usage(message) => write!(f, "usage failure: {}", message),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Failure::Transport(err) => Some(err),
            Failure::Protocol(_) | Failure::Usage(_) => None,
        }
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        Failure::Transport(err)
    }
}

// `io::Error` isn't `Clone`, but a `Failure` is handed to every pending
// completion and then kept around for `ConnectionCore::failure()` to hand
// out again later, so we carry the kind and message forward by hand rather
// than forcing every caller to share it behind an `Rc`.
impl Clone for Failure {
    fn clone(&self) -> Self {
        match self {
            Failure::Transport(err) => Failure::Transport(io::Error::new(err.kind(), err.to_string())),
            Failure::Protocol(message) => Failure::Protocol(message.clone()),
            Failure::Usage(message) => Failure::Usage(message.clone()),
        }
    }
}
