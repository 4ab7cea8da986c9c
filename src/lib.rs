//! # gramlink
//!
//! A connection-oriented message transport layered over UDP.
//!
//! Peers exchange discrete application messages with a choice of delivery
//! guarantees, from fire-and-forget to reliable-ordered. The transport
//! performs the connection handshake, keep-alive and teardown, discovers the
//! usable path MTU, fragments oversized payloads, and coalesces small
//! messages into shared datagrams.
//!
//! ## Architecture
//!
//! - **Reliability**: per-channel sliding-window ARQ with selective
//!   acknowledgements, delay-based retransmission, and hole-triggered early
//!   resend.
//! - **Delivery methods**: unreliable, unreliable-sequenced,
//!   reliable-unordered, reliable-sequenced, and reliable-ordered, each with
//!   32 independent channels where ordering applies.
//! - **Wire codec**: a bit-granular buffer packs values at arbitrary bit
//!   offsets, with varints, sign-magnitude integers, and length-prefixed
//!   UTF-8 strings.
//! - **Scheduling**: one transport thread ticks every connection; the public
//!   send and receive API is safe from any thread.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gramlink::{DeliveryMethod, IncomingKind, Peer, PeerConfig};
//!
//! let mut config = PeerConfig::new("my-app");
//! config.accept_incoming_connections = true;
//! let server = Peer::new(config).unwrap();
//! server.start().unwrap();
//!
//! let client = Peer::new(PeerConfig::new("my-app")).unwrap();
//! client.start().unwrap();
//! let conn = client.connect(server.local_addr().unwrap(), None).unwrap();
//!
//! let mut msg = client.create_message();
//! msg.write_str("hello");
//! client.send_message(msg, &conn, DeliveryMethod::ReliableOrdered, 0);
//!
//! while let Some(mut incoming) = server.take_inbound(Duration::from_secs(1)) {
//!     if let IncomingKind::Data { .. } = incoming.kind() {
//!         println!("{}", incoming.read_str().unwrap());
//!         break;
//!     }
//! }
//! ```

pub mod assembler;
pub mod bitset;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod message;
pub mod mtu;
pub mod peer;
pub mod protocol;
pub mod sequence;
pub mod time;

use std::net::SocketAddr;

pub use buffer::MsgBuffer;
pub use config::{MessageClass, PeerConfig, UnreliableSizeMode};
pub use connection::{ConnectionHandle, ConnectionStats, ConnectionStatus};
pub use error::{SendResult, TransportError};
pub use message::{IncomingKind, IncomingMessage, OutgoingMessage, StatsSnapshot};
pub use peer::Peer;
pub use protocol::DeliveryMethod;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

/// Where connection-built datagrams go.
///
/// The peer implements this over its UDP socket; tests substitute in-memory
/// pipes to run the protocol deterministically.
pub trait DatagramSink {
    fn send_datagram(&mut self, payload: &[u8], to: SocketAddr) -> Result<(), TransportError>;
}
