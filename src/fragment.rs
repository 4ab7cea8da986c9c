//! Fragmentation of oversized messages and reassembly of received chunks.
//!
//! Each fragment carries a four-field varint header after the base message
//! header: `{group, total_bits, chunk_byte_size, chunk_index}`. All chunks in
//! a group share the same chunk size except a shorter last chunk. Reassembly
//! is keyed by group id per connection and holds a group until it completes.

use std::collections::HashMap;

use tracing::warn;

use crate::buffer::{var_u32_size, MsgBuffer};
use crate::error::TransportError;
use crate::protocol::BASE_HEADER_BYTES;

/// Upper bound on a reassembled message, guarding allocation against a
/// malicious or corrupt total-bits field.
pub const MAX_REASSEMBLED_BYTES: usize = 8 * 1024 * 1024;

/// Header attached to every fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Identifies all fragments of one logical message; monotonic per sender.
    pub group: u32,
    /// Exact bit length of the reassembled payload.
    pub total_bits: u32,
    /// Byte size shared by every chunk except a shorter last one.
    pub chunk_byte_size: u32,
    /// Position of this chunk within the group.
    pub chunk_index: u32,
}

impl FragmentHeader {
    /// Encoded size of this header in bytes.
    pub fn encoded_len(&self) -> usize {
        var_u32_size(self.group)
            + var_u32_size(self.total_bits)
            + var_u32_size(self.chunk_byte_size)
            + var_u32_size(self.chunk_index)
    }

    pub fn encode_vec(&self, out: &mut Vec<u8>) {
        for value in [
            self.group,
            self.total_bits,
            self.chunk_byte_size,
            self.chunk_index,
        ] {
            let mut v = value;
            while v >= 0x80 {
                out.push((v as u8) | 0x80);
                v >>= 7;
            }
            out.push(v as u8);
        }
    }

    pub fn encode(&self, buf: &mut MsgBuffer) {
        buf.write_var_u32(self.group);
        buf.write_var_u32(self.total_bits);
        buf.write_var_u32(self.chunk_byte_size);
        buf.write_var_u32(self.chunk_index);
    }

    pub fn decode(buf: &mut MsgBuffer) -> Result<Self, TransportError> {
        Ok(Self {
            group: buf.read_var_u32()?,
            total_bits: buf.read_var_u32()?,
            chunk_byte_size: buf.read_var_u32()?,
            chunk_index: buf.read_var_u32()?,
        })
    }

    /// Decodes from a raw datagram, advancing `pos`.
    pub(crate) fn decode_slice(data: &[u8], pos: &mut usize) -> Result<Self, TransportError> {
        let mut fields = [0u32; 4];
        for field in fields.iter_mut() {
            *field = read_var_u32_slice(data, pos)?;
        }
        Ok(Self {
            group: fields[0],
            total_bits: fields[1],
            chunk_byte_size: fields[2],
            chunk_index: fields[3],
        })
    }

    /// Number of chunks in the group this header belongs to.
    pub fn chunk_count(&self) -> usize {
        (self.total_bits as usize).div_ceil(self.chunk_byte_size as usize * 8)
    }
}

fn read_var_u32_slice(data: &[u8], pos: &mut usize) -> Result<u32, TransportError> {
    let mut value = 0u32;
    for i in 0..5 {
        let byte = *data.get(*pos).ok_or(TransportError::MalformedDatagram)?;
        *pos += 1;
        if i == 4 && byte > 0x0F {
            return Err(TransportError::MalformedVarint);
        }
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(TransportError::MalformedVarint)
}

/// Picks the largest chunk size such that a full chunk, its fragment header,
/// and the base header fit within `mtu`. Starts from an approximation and
/// decrements until the constraint holds.
pub fn best_chunk_size(mtu: usize, total_bits: usize, group: u32) -> usize {
    let total_bytes = total_bits.div_ceil(8);
    let mut chunk = mtu.saturating_sub(BASE_HEADER_BYTES + 4).max(1);
    loop {
        let chunk_count = total_bytes.div_ceil(chunk);
        let worst_header = FragmentHeader {
            group,
            total_bits: total_bits as u32,
            chunk_byte_size: chunk as u32,
            chunk_index: chunk_count as u32,
        };
        if chunk + worst_header.encoded_len() + BASE_HEADER_BYTES <= mtu || chunk == 1 {
            return chunk;
        }
        chunk -= 1;
    }
}

/// A group of chunks being collected into one message.
#[derive(Debug)]
struct FragmentGroup {
    total_bits: usize,
    chunk_byte_size: usize,
    chunk_count: usize,
    data: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
}

/// Per-connection reassembly of fragment groups.
///
/// Groups are held only until complete; an incomplete group persists for the
/// life of the connection.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: HashMap<u32, FragmentGroup>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a received chunk. Returns the reassembled payload when the
    /// group completes. Duplicate chunks overwrite idempotently.
    pub fn insert(
        &mut self,
        header: &FragmentHeader,
        payload: &[u8],
    ) -> Result<Option<MsgBuffer>, TransportError> {
        let total_bits = header.total_bits as usize;
        let chunk_byte_size = header.chunk_byte_size as usize;
        let total_bytes = total_bits.div_ceil(8);
        if chunk_byte_size == 0 || total_bits == 0 || total_bytes > MAX_REASSEMBLED_BYTES {
            return Err(TransportError::MalformedDatagram);
        }
        let chunk_count = header.chunk_count();
        let index = header.chunk_index as usize;
        if index >= chunk_count {
            return Err(TransportError::MalformedDatagram);
        }

        let group = self.groups.entry(header.group).or_insert_with(|| FragmentGroup {
            total_bits,
            chunk_byte_size,
            chunk_count,
            data: vec![0; total_bytes],
            received: vec![false; chunk_count],
            received_count: 0,
        });

        if group.total_bits != total_bits || group.chunk_byte_size != chunk_byte_size {
            warn!(
                group = header.group,
                "fragment header disagrees with earlier chunks of the same group"
            );
            return Err(TransportError::MalformedDatagram);
        }

        let offset = index * chunk_byte_size;
        let expected = if index == chunk_count - 1 {
            total_bytes - offset
        } else {
            chunk_byte_size
        };
        if payload.len() < expected {
            return Err(TransportError::MalformedDatagram);
        }

        group.data[offset..offset + expected].copy_from_slice(&payload[..expected]);
        if !group.received[index] {
            group.received[index] = true;
            group.received_count += 1;
        }

        if group.received_count == group.chunk_count {
            let group = self.groups.remove(&header.group).unwrap();
            return Ok(Some(MsgBuffer::from_bytes_with_bit_length(
                group.data,
                group.total_bits,
            )));
        }
        Ok(None)
    }

    /// Number of incomplete groups currently held.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}
