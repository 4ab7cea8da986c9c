//! Application-facing message types and buffer recycling.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::MsgBuffer;
use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::fragment::FragmentHeader;
use crate::protocol::{DeliveryMethod, BASE_HEADER_BYTES};

/// A message under construction by the application.
///
/// Write into it with the [`MsgBuffer`] API, then hand it to a send call.
/// Sending moves the message into the transport, so a transmitted payload can
/// never be mutated or re-sent; sharing with multiple recipients goes through
/// `send_to_many`, which reference-counts the payload internally.
#[derive(Debug, Default)]
pub struct OutgoingMessage {
    buffer: MsgBuffer,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buffer: MsgBuffer::with_capacity(bytes),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            buffer: MsgBuffer::from_bytes(data),
        }
    }

    pub(crate) fn from_recycled(storage: Vec<u8>) -> Self {
        Self {
            buffer: MsgBuffer::from_recycled(storage),
        }
    }

    pub(crate) fn into_buffer(self) -> MsgBuffer {
        self.buffer
    }
}

impl Deref for OutgoingMessage {
    type Target = MsgBuffer;

    fn deref(&self) -> &MsgBuffer {
        &self.buffer
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut MsgBuffer {
        &mut self.buffer
    }
}

/// A message inside the transport: the bit-packed payload plus framing state.
///
/// Fragments of one oversized message share the parent payload through the
/// `Arc`, windowed by `byte_offset` and `bit_length`; the storage is freed
/// when the last channel reference drops.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub kind: u8,
    pub data: Arc<Vec<u8>>,
    pub byte_offset: usize,
    pub bit_length: usize,
    pub fragment: Option<FragmentHeader>,
}

impl QueuedMessage {
    pub fn from_outgoing(msg: OutgoingMessage, kind: u8) -> Self {
        let buffer = msg.into_buffer();
        let bit_length = buffer.len_bits();
        Self {
            kind,
            data: Arc::new(buffer.into_bytes()),
            byte_offset: 0,
            bit_length,
            fragment: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.byte_offset..self.byte_offset + self.bit_length.div_ceil(8)]
    }

    /// Bytes this message occupies inside a datagram.
    pub fn encoded_size(&self) -> usize {
        BASE_HEADER_BYTES
            + self.fragment.as_ref().map_or(0, |h| h.encoded_len())
            + self.bit_length.div_ceil(8)
    }

    /// Splits the payload into fragments that fit `mtu`, all stamped with
    /// `group`. The chunks share this message's storage.
    pub fn split_fragments(&self, mtu: usize, group: u32) -> Vec<QueuedMessage> {
        let total_bits = self.bit_length;
        let chunk_bytes = crate::fragment::best_chunk_size(mtu, total_bits, group);
        let chunk_count = total_bits.div_ceil(chunk_bytes * 8);
        let mut chunks = Vec::with_capacity(chunk_count);
        for index in 0..chunk_count {
            let bit_offset = index * chunk_bytes * 8;
            chunks.push(QueuedMessage {
                kind: self.kind,
                data: Arc::clone(&self.data),
                byte_offset: self.byte_offset + index * chunk_bytes,
                bit_length: (total_bits - bit_offset).min(chunk_bytes * 8),
                fragment: Some(FragmentHeader {
                    group,
                    total_bits: total_bits as u32,
                    chunk_byte_size: chunk_bytes as u32,
                    chunk_index: index as u32,
                }),
            });
        }
        chunks
    }
}

/// What an inbound queue item is about.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingKind {
    /// Application data; the payload is in the message buffer.
    Data {
        method: DeliveryMethod,
        channel: u8,
        sequence: u16,
    },
    /// A connection changed status.
    StatusChanged {
        status: ConnectionStatus,
        reason: String,
    },
    /// A remote peer wants to connect and awaits `approve`/`deny` on the
    /// sender handle; the hail payload is in the message buffer.
    ConnectionApproval,
    /// Connectionless data from an arbitrary endpoint.
    UnconnectedData,
    /// A new round-trip time measurement for the sender connection.
    ConnectionLatencyUpdated { rtt: Duration },
    DebugMessage { text: String },
    WarningMessage { text: String },
    ErrorMessage { text: String },
}

/// A message surfaced to the application.
#[derive(Debug)]
pub struct IncomingMessage {
    kind: IncomingKind,
    buffer: MsgBuffer,
    sender: Option<ConnectionHandle>,
    sender_addr: Option<SocketAddr>,
    received_at: Instant,
}

impl IncomingMessage {
    pub(crate) fn new(
        kind: IncomingKind,
        buffer: MsgBuffer,
        sender: Option<ConnectionHandle>,
        sender_addr: Option<SocketAddr>,
        received_at: Instant,
    ) -> Self {
        Self {
            kind,
            buffer,
            sender,
            sender_addr,
            received_at,
        }
    }

    pub fn kind(&self) -> &IncomingKind {
        &self.kind
    }

    pub fn sender(&self) -> Option<&ConnectionHandle> {
        self.sender.as_ref()
    }

    pub fn sender_addr(&self) -> Option<SocketAddr> {
        self.sender_addr
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn len_bits(&self) -> usize {
        self.buffer.len_bits()
    }

    pub fn len_bytes(&self) -> usize {
        self.buffer.len_bytes()
    }

    pub(crate) fn into_storage(self) -> Vec<u8> {
        self.buffer.into_bytes()
    }
}

impl Deref for IncomingMessage {
    type Target = MsgBuffer;

    fn deref(&self) -> &MsgBuffer {
        &self.buffer
    }
}

impl DerefMut for IncomingMessage {
    fn deref_mut(&mut self) -> &mut MsgBuffer {
        &mut self.buffer
    }
}

/// Lock-guarded free-list of payload buffers.
///
/// Disabled pools hand out fresh allocations and drop returns.
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    enabled: bool,
    max_held: usize,
}

impl BufferPool {
    pub fn new(enabled: bool) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            enabled,
            max_held: 64,
        }
    }

    pub fn take(&self, capacity: usize) -> Vec<u8> {
        if self.enabled {
            if let Some(mut buf) = self.free.lock().pop() {
                buf.clear();
                buf.reserve(capacity);
                return buf;
            }
        }
        Vec::with_capacity(capacity)
    }

    pub fn put(&self, buf: Vec<u8>) {
        if !self.enabled {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_held {
            free.push(buf);
        }
    }
}

/// Snapshot of per-connection traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_messages: u64,
    pub received_messages: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    /// Retransmissions triggered by the resend timer.
    pub delay_resends: u64,
    /// Retransmissions triggered by an acknowledged hole.
    pub hole_resends: u64,
    pub dropped_messages: u64,
}
