//! Single-threaded MQTT 3.1 client connection engine.
//!
//! Layers QoS 0/1/2 publish/subscribe handshakes, message id bookkeeping,
//! flow-control backpressure and keep-alive over an already-connected
//! [`Transport`]. Establishing the network connection and running
//! CONNECT/CONNACK happen before a transport ever reaches [`ConnectionCore`]
//! -- this crate only drives the connection once it's up.

#[macro_use]
extern crate log;

mod connection;
mod encode;
mod error;
mod heartbeat;
mod id;
mod inflight;
mod outbound;
mod panic_sink;
mod transport;

pub use crate::connection::{AckCompletion, ConnectionCore, Listener};
pub use crate::error::Failure;
pub use crate::transport::Transport;

pub use mqtt_packet::{Packet, PacketId, QoS, SubscribeReturnCode};
