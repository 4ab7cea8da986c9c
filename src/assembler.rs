//! Coalesces outgoing messages into MTU-sized datagrams.

use crate::fragment::FragmentHeader;
use crate::message::QueuedMessage;
use crate::protocol::{encode_frame, BASE_HEADER_BYTES};

/// Builds datagrams for one connection during a heartbeat.
///
/// Messages append to a pending buffer; whenever the next message would push
/// the buffer past the MTU, the pending bytes are sealed into a datagram
/// first. A single message larger than the MTU still goes out as one
/// datagram of its own.
#[derive(Debug)]
pub struct PacketAssembler {
    pending: Vec<u8>,
    sealed: Vec<Vec<u8>>,
    mtu: usize,
}

impl PacketAssembler {
    pub fn new(mtu: usize) -> Self {
        Self {
            pending: Vec::with_capacity(mtu),
            sealed: Vec::new(),
            mtu,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Bytes still available in the pending datagram.
    pub fn remaining(&self) -> usize {
        self.mtu.saturating_sub(self.pending.len())
    }

    pub fn queue_message(&mut self, msg: &QueuedMessage, sequence: u16) {
        self.queue_frame(
            msg.kind,
            sequence,
            msg.fragment.as_ref(),
            msg.bit_length,
            msg.payload(),
        );
    }

    /// Queues a library message whose payload is plain bytes.
    pub fn queue_raw(&mut self, kind: u8, sequence: u16, payload: &[u8]) {
        self.queue_frame(kind, sequence, None, payload.len() * 8, payload);
    }

    fn queue_frame(
        &mut self,
        kind: u8,
        sequence: u16,
        fragment: Option<&FragmentHeader>,
        bit_length: usize,
        payload: &[u8],
    ) {
        let encoded = BASE_HEADER_BYTES
            + fragment.map_or(0, |h| h.encoded_len())
            + bit_length.div_ceil(8);
        if !self.pending.is_empty() && self.pending.len() + encoded > self.mtu {
            self.flush_pending();
        }
        encode_frame(&mut self.pending, kind, sequence, fragment, bit_length, payload);
        if self.pending.len() > self.mtu {
            self.flush_pending();
        }
    }

    /// Seals the pending buffer into a datagram.
    pub fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            self.sealed.push(std::mem::take(&mut self.pending));
        }
    }

    /// Seals any remainder and returns every datagram built this heartbeat.
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        self.flush_pending();
        std::mem::take(&mut self.sealed)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.sealed.is_empty()
    }
}
