//! Per-(delivery method, channel) send and receive state.
//!
//! Each connection lazily creates one sender channel per outgoing application
//! kind and one receiver channel per incoming application kind. Sequence
//! numbers are assigned per kind, so the window arithmetic in this module
//! never sees traffic from another channel.

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverChannel;
pub use sender::SenderChannel;

use crate::fragment::FragmentHeader;

/// Window size for the reliable delivery methods.
pub const RELIABLE_WINDOW: u16 = 64;
/// Window size for the unreliable delivery methods.
pub const UNRELIABLE_WINDOW: u16 = 128;

/// A received application message flowing through a receiver channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub kind: u8,
    pub sequence: u16,
    pub fragment: Option<FragmentHeader>,
    pub payload: Vec<u8>,
    pub bit_length: usize,
}
