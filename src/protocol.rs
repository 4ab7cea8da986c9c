//! Wire protocol: message kinds, the 5-byte base header, datagram parsing,
//! acknowledgement payloads, and the handshake payload codecs.
//!
//! A datagram is a concatenation of messages, each framed as:
//!
//! ```text
//! offset 0 : u8  message kind
//! offset 1 : u8  bit 0 = fragment flag, bits 1..7 = seq[0..6]
//! offset 2 : u8  seq[7..14]
//! offset 3 : u16 payload bit length (little-endian)
//! ```
//!
//! followed by an optional fragment header and `ceil(bits / 8)` payload bytes.

use smallvec::SmallVec;

use crate::buffer::MsgBuffer;
use crate::error::TransportError;
use crate::fragment::FragmentHeader;

/// Size of the fixed message header in bytes.
pub const BASE_HEADER_BYTES: usize = 5;

/// Bytes per acknowledgement entry in an Acknowledge payload.
pub const ACK_ENTRY_BYTES: usize = 3;

/// Largest payload expressible by the 16-bit payload-bit-length field.
pub const MAX_UNFRAGMENTED_BYTES: usize = u16::MAX as usize / 8 - 1;

/// Hard cap on MTU probing, bounded by the payload-bit-length field.
pub const MTU_PROBE_CAP: usize = u16::MAX as usize / 8 - 1;

/// Library message kinds.
pub const KIND_UNCONNECTED: u8 = 0;
pub const KIND_PING: u8 = 1;
pub const KIND_PONG: u8 = 2;
pub const KIND_CONNECT: u8 = 3;
pub const KIND_CONNECT_RESPONSE: u8 = 4;
pub const KIND_CONNECTION_ESTABLISHED: u8 = 5;
pub const KIND_ACKNOWLEDGE: u8 = 6;
pub const KIND_DISCONNECT: u8 = 7;
pub const KIND_MTU_PROBE: u8 = 8;
pub const KIND_MTU_PROBE_SUCCESS: u8 = 9;

/// First kind of the application range; everything below is library traffic.
pub const KIND_USER_FIRST: u8 = 32;
pub const KIND_USER_UNRELIABLE: u8 = 32;
pub const KIND_USER_SEQUENCED_FIRST: u8 = 33;
pub const KIND_USER_RELIABLE_UNORDERED: u8 = 65;
pub const KIND_USER_RELIABLE_SEQUENCED_FIRST: u8 = 66;
pub const KIND_USER_RELIABLE_ORDERED_FIRST: u8 = 98;
pub const KIND_USER_LAST: u8 = 129;

/// Channels available to the sequenced and ordered delivery methods.
pub const CHANNELS_PER_METHOD: u8 = 32;

/// Number of per-connection channel slots (one per application kind).
pub const CHANNEL_SLOTS: usize = (KIND_USER_LAST - KIND_USER_FIRST) as usize + 1;

/// How application messages are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// Fire and forget; may be lost, duplicated, or reordered.
    Unreliable,
    /// May be lost; late arrivals are dropped so delivery never goes backwards.
    UnreliableSequenced,
    /// Retransmitted until acknowledged; arrival order is not restored.
    ReliableUnordered,
    /// Retransmitted until acknowledged; late arrivals are dropped.
    ReliableSequenced,
    /// Retransmitted until acknowledged and delivered in send order.
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    /// Channels usable with this method. Unordered methods have a single
    /// channel because cross-message ordering is meaningless for them.
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            _ => CHANNELS_PER_METHOD,
        }
    }

    /// The wire kind for this method on `channel`.
    pub fn to_kind(self, channel: u8) -> u8 {
        debug_assert!(channel < self.channel_count());
        match self {
            DeliveryMethod::Unreliable => KIND_USER_UNRELIABLE,
            DeliveryMethod::UnreliableSequenced => KIND_USER_SEQUENCED_FIRST + channel,
            DeliveryMethod::ReliableUnordered => KIND_USER_RELIABLE_UNORDERED,
            DeliveryMethod::ReliableSequenced => KIND_USER_RELIABLE_SEQUENCED_FIRST + channel,
            DeliveryMethod::ReliableOrdered => KIND_USER_RELIABLE_ORDERED_FIRST + channel,
        }
    }

    /// Decomposes a wire kind in the application range.
    pub fn from_kind(kind: u8) -> Option<(DeliveryMethod, u8)> {
        match kind {
            KIND_USER_UNRELIABLE => Some((DeliveryMethod::Unreliable, 0)),
            k if (KIND_USER_SEQUENCED_FIRST..KIND_USER_RELIABLE_UNORDERED).contains(&k) => Some((
                DeliveryMethod::UnreliableSequenced,
                k - KIND_USER_SEQUENCED_FIRST,
            )),
            KIND_USER_RELIABLE_UNORDERED => Some((DeliveryMethod::ReliableUnordered, 0)),
            k if (KIND_USER_RELIABLE_SEQUENCED_FIRST..KIND_USER_RELIABLE_ORDERED_FIRST)
                .contains(&k) =>
            {
                Some((
                    DeliveryMethod::ReliableSequenced,
                    k - KIND_USER_RELIABLE_SEQUENCED_FIRST,
                ))
            }
            k if (KIND_USER_RELIABLE_ORDERED_FIRST..=KIND_USER_LAST).contains(&k) => Some((
                DeliveryMethod::ReliableOrdered,
                k - KIND_USER_RELIABLE_ORDERED_FIRST,
            )),
            _ => None,
        }
    }
}

/// Returns true for kinds in the application data range.
#[inline]
pub fn is_user_kind(kind: u8) -> bool {
    (KIND_USER_FIRST..=KIND_USER_LAST).contains(&kind)
}

/// Slot index for the per-connection channel arrays.
#[inline]
pub fn channel_slot(kind: u8) -> usize {
    debug_assert!(is_user_kind(kind));
    (kind - KIND_USER_FIRST) as usize
}

/// One message parsed out of a datagram. Payload borrows from the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    pub kind: u8,
    pub sequence: u16,
    pub fragment: Option<FragmentHeader>,
    pub bit_length: usize,
    pub payload: &'a [u8],
}

/// Steps through the messages coalesced into one datagram.
///
/// Any inconsistency between the declared lengths and the datagram size is a
/// malformed datagram; the caller drops the whole datagram.
pub struct DatagramParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DatagramParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn next_message(&mut self) -> Result<Option<ParsedMessage<'a>>, TransportError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.data.len() - self.pos < BASE_HEADER_BYTES {
            return Err(TransportError::MalformedDatagram);
        }

        let kind = self.data[self.pos];
        let low = self.data[self.pos + 1];
        let is_fragment = low & 1 != 0;
        let sequence = ((low >> 1) as u16) | ((self.data[self.pos + 2] as u16) << 7);
        let bit_length =
            u16::from_le_bytes([self.data[self.pos + 3], self.data[self.pos + 4]]) as usize;
        self.pos += BASE_HEADER_BYTES;

        let fragment = if is_fragment {
            Some(FragmentHeader::decode_slice(self.data, &mut self.pos)?)
        } else {
            None
        };

        let payload_bytes = bit_length.div_ceil(8);
        if self.data.len() - self.pos < payload_bytes {
            return Err(TransportError::MalformedDatagram);
        }
        let payload = &self.data[self.pos..self.pos + payload_bytes];
        self.pos += payload_bytes;

        Ok(Some(ParsedMessage {
            kind,
            sequence,
            fragment,
            bit_length,
            payload,
        }))
    }
}

/// Encodes a message frame into a pending datagram buffer.
pub fn encode_frame(
    out: &mut Vec<u8>,
    kind: u8,
    sequence: u16,
    fragment: Option<&FragmentHeader>,
    bit_length: usize,
    payload: &[u8],
) {
    debug_assert!(bit_length <= u16::MAX as usize);
    debug_assert!(payload.len() == bit_length.div_ceil(8));
    out.push(kind);
    out.push((fragment.is_some() as u8) | ((sequence as u8 & 0x7F) << 1));
    out.push((sequence >> 7) as u8);
    out.extend_from_slice(&(bit_length as u16).to_le_bytes());
    if let Some(header) = fragment {
        header.encode_vec(out);
    }
    out.extend_from_slice(payload);
}

/// Handshake payload for Connect and ConnectResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeData {
    pub app_id: String,
    pub unique_id: i64,
    pub remote_time_ms: i64,
    pub hail: Vec<u8>,
}

impl HandshakeData {
    pub fn encode(&self, buf: &mut MsgBuffer) {
        buf.write_str(&self.app_id);
        buf.write_u64(self.unique_id as u64);
        buf.write_var_i64(self.remote_time_ms);
        buf.write_bytes(&self.hail);
    }

    pub fn decode(buf: &mut MsgBuffer) -> Result<Self, TransportError> {
        let app_id = buf.read_str()?;
        let unique_id = buf.read_u64()? as i64;
        let remote_time_ms = buf.read_var_i64()?;
        let hail = buf.read_remaining_bytes();
        Ok(Self {
            app_id,
            unique_id,
            remote_time_ms,
            hail,
        })
    }
}

/// Payload of ConnectionEstablished.
pub fn encode_established(buf: &mut MsgBuffer, remote_time_ms: i64) {
    buf.write_var_i64(remote_time_ms);
}

pub fn decode_established(buf: &mut MsgBuffer) -> Result<i64, TransportError> {
    buf.read_var_i64()
}

/// Payload of Disconnect.
pub fn encode_disconnect(buf: &mut MsgBuffer, reason: &str) {
    buf.write_str(reason);
}

pub fn decode_disconnect(buf: &mut MsgBuffer) -> Result<String, TransportError> {
    buf.read_str()
}

/// Payload of Ping: the ping number.
pub fn encode_ping(buf: &mut MsgBuffer, nr: u8) {
    buf.write_u8(nr);
}

/// Payload of Pong: the echoed ping number and the responder's clock.
pub fn encode_pong(buf: &mut MsgBuffer, nr: u8, remote_time_ms: i64) {
    buf.write_u8(nr);
    buf.write_var_i64(remote_time_ms);
}

pub fn decode_pong(buf: &mut MsgBuffer) -> Result<(u8, i64), TransportError> {
    let nr = buf.read_u8()?;
    let remote_time_ms = buf.read_var_i64()?;
    Ok((nr, remote_time_ms))
}

/// Decodes an Acknowledge payload into `(kind, sequence)` entries.
pub fn decode_acks(
    payload: &[u8],
    bit_length: usize,
) -> Result<SmallVec<[(u8, u16); 8]>, TransportError> {
    let byte_len = bit_length / 8;
    if bit_length % 8 != 0 || byte_len % ACK_ENTRY_BYTES != 0 || byte_len > payload.len() {
        return Err(TransportError::MalformedDatagram);
    }
    let mut acks = SmallVec::with_capacity(byte_len / ACK_ENTRY_BYTES);
    for entry in payload[..byte_len].chunks_exact(ACK_ENTRY_BYTES) {
        acks.push((entry[0], u16::from_le_bytes([entry[1], entry[2]])));
    }
    Ok(acks)
}

/// Encodes acknowledgement entries into a payload buffer.
pub fn encode_acks(acks: &[(u8, u16)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(acks.len() * ACK_ENTRY_BYTES);
    for &(kind, seq) in acks {
        out.push(kind);
        out.extend_from_slice(&seq.to_le_bytes());
    }
    out
}
