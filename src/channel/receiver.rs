//! Receiver-side channels: duplicate/late/early policy and delivery ordering.
//!
//! The connection has already queued an acknowledgement for every received
//! sequence before the channel sees it; what happens here only decides
//! whether and when the message reaches the application.

use tracing::debug;

use super::{ChannelMessage, RELIABLE_WINDOW};
use crate::bitset::BitSet;
use crate::protocol::DeliveryMethod;
use crate::sequence::{advance, relative};

/// Bit-vector words covering one reliable window.
const WINDOW_WORDS: usize = RELIABLE_WINDOW as usize / 64;

#[derive(Debug)]
pub enum ReceiverChannel {
    /// Deliver everything in arrival order.
    UnreliableUnordered,
    /// Drop anything older than the newest delivered sequence.
    UnreliableSequenced { expected: u16 },
    /// Window-filtered, delivered in arrival order; duplicates dropped.
    ReliableUnordered {
        window_start: u16,
        early_received: BitSet<WINDOW_WORDS>,
    },
    /// Window-filtered; an early arrival is delivered and skips the window
    /// past the gap. Explicitly sequenced, not ordered: skipped sequences
    /// are lost even though the sender will retransmit them.
    ReliableSequenced { window_start: u16 },
    /// Early arrivals are withheld and released in send order.
    ReliableOrdered {
        window_start: u16,
        early_received: BitSet<WINDOW_WORDS>,
        withheld: Vec<Option<ChannelMessage>>,
    },
}

impl ReceiverChannel {
    pub fn new_for(method: DeliveryMethod) -> Self {
        match method {
            DeliveryMethod::Unreliable => ReceiverChannel::UnreliableUnordered,
            DeliveryMethod::UnreliableSequenced => {
                ReceiverChannel::UnreliableSequenced { expected: 0 }
            }
            DeliveryMethod::ReliableUnordered => ReceiverChannel::ReliableUnordered {
                window_start: 0,
                early_received: BitSet::new(),
            },
            DeliveryMethod::ReliableSequenced => {
                ReceiverChannel::ReliableSequenced { window_start: 0 }
            }
            DeliveryMethod::ReliableOrdered => ReceiverChannel::ReliableOrdered {
                window_start: 0,
                early_received: BitSet::new(),
                withheld: (0..RELIABLE_WINDOW).map(|_| None).collect(),
            },
        }
    }

    /// Applies the channel policy to one received message, invoking `deliver`
    /// for everything that reaches the application, in delivery order.
    pub fn receive(&mut self, msg: ChannelMessage, deliver: &mut dyn FnMut(ChannelMessage)) {
        match self {
            ReceiverChannel::UnreliableUnordered => deliver(msg),

            ReceiverChannel::UnreliableSequenced { expected } => {
                if relative(msg.sequence, *expected) < 0 {
                    debug!(seq = msg.sequence, "late sequenced message dropped");
                    return;
                }
                *expected = advance(msg.sequence, 1);
                deliver(msg);
            }

            ReceiverChannel::ReliableUnordered {
                window_start,
                early_received,
            } => {
                let relate = relative(msg.sequence, *window_start);
                if relate < 0 {
                    debug!(seq = msg.sequence, "duplicate reliable message dropped");
                    return;
                }
                if relate == 0 {
                    deliver(msg);
                    *window_start = advance(*window_start, 1);
                    // Everything contiguous was already delivered on arrival.
                    while early_received.unset((*window_start % RELIABLE_WINDOW) as usize) {
                        *window_start = advance(*window_start, 1);
                    }
                    return;
                }
                if relate > RELIABLE_WINDOW as i32 {
                    debug!(seq = msg.sequence, "too-early reliable message dropped");
                    return;
                }
                if early_received.set((msg.sequence % RELIABLE_WINDOW) as usize) {
                    deliver(msg);
                } else {
                    debug!(seq = msg.sequence, "duplicate early message dropped");
                }
            }

            ReceiverChannel::ReliableSequenced { window_start } => {
                let relate = relative(msg.sequence, *window_start);
                if relate < 0 {
                    debug!(seq = msg.sequence, "late reliable-sequenced message dropped");
                    return;
                }
                if relate > RELIABLE_WINDOW as i32 {
                    debug!(seq = msg.sequence, "too-early reliable-sequenced message dropped");
                    return;
                }
                *window_start = advance(msg.sequence, 1);
                deliver(msg);
            }

            ReceiverChannel::ReliableOrdered {
                window_start,
                early_received,
                withheld,
            } => {
                let relate = relative(msg.sequence, *window_start);
                if relate < 0 {
                    debug!(seq = msg.sequence, "late ordered message dropped");
                    return;
                }
                if relate == 0 {
                    deliver(msg);
                    *window_start = advance(*window_start, 1);
                    // Release every withheld message that is now contiguous.
                    while early_received.unset((*window_start % RELIABLE_WINDOW) as usize) {
                        let held = withheld[(*window_start % RELIABLE_WINDOW) as usize]
                            .take()
                            .expect("withheld slot must be filled when its bit is set");
                        deliver(held);
                        *window_start = advance(*window_start, 1);
                    }
                    return;
                }
                if relate > RELIABLE_WINDOW as i32 {
                    debug!(seq = msg.sequence, "too-early ordered message dropped");
                    return;
                }
                let slot = (msg.sequence % RELIABLE_WINDOW) as usize;
                if early_received.set(slot) {
                    withheld[slot] = Some(msg);
                } else {
                    debug!(seq = msg.sequence, "duplicate withheld message dropped");
                }
            }
        }
    }
}
