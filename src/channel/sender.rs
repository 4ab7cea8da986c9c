//! Sender-side channels: windowed unreliable sending and reliable
//! store-until-acknowledged sending with delay and hole retransmission.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::{RELIABLE_WINDOW, UNRELIABLE_WINDOW};
use crate::assembler::PacketAssembler;
use crate::bitset::BitSet;
use crate::error::SendResult;
use crate::message::QueuedMessage;
use crate::protocol::DeliveryMethod;
use crate::sequence::{advance, relative, SEQUENCE_SPACE};

/// Base component of the retransmission delay.
const RESEND_DELAY_FLOOR: Duration = Duration::from_millis(25);
/// Round-trip multiplier of the retransmission delay.
const RESEND_RTT_FACTOR: f32 = 2.1;
/// Assumed round-trip time before the first measurement.
pub const DEFAULT_RTT: Duration = Duration::from_millis(100);
/// Fraction of the resend delay a hole must have been in flight before the
/// early-ack heuristic retransmits it.
const HOLE_RESEND_FACTOR: f32 = 0.35;

/// Bit-vector words covering the whole sequence space.
const ACK_WORDS: usize = SEQUENCE_SPACE as usize / 64;

/// Retransmission delay for the current round-trip estimate.
pub fn resend_delay(average_rtt: Option<Duration>) -> Duration {
    RESEND_DELAY_FLOOR + average_rtt.unwrap_or(DEFAULT_RTT).mul_f32(RESEND_RTT_FACTOR)
}

/// Counters a channel reports back to its connection per heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendAccounting {
    pub sent: u64,
    pub sent_bytes: u64,
    pub delay_resends: u64,
    pub hole_resends: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub enum SenderChannel {
    Unreliable(UnreliableSender),
    Reliable(ReliableSender),
}

impl SenderChannel {
    pub fn new_for(method: DeliveryMethod) -> Self {
        if method.is_reliable() {
            SenderChannel::Reliable(ReliableSender::new(RELIABLE_WINDOW))
        } else {
            SenderChannel::Unreliable(UnreliableSender::new(UNRELIABLE_WINDOW))
        }
    }

    pub fn enqueue(&mut self, msg: QueuedMessage, acct: &mut SendAccounting) -> SendResult {
        match self {
            SenderChannel::Unreliable(ch) => ch.enqueue(msg, acct),
            SenderChannel::Reliable(ch) => ch.enqueue(msg),
        }
    }

    pub fn send_queued(&mut self, now: Instant, out: &mut PacketAssembler, acct: &mut SendAccounting) {
        match self {
            SenderChannel::Unreliable(ch) => ch.send_queued(out, acct),
            SenderChannel::Reliable(ch) => ch.send_queued(now, out, acct),
        }
    }

    pub fn receive_ack(
        &mut self,
        sequence: u16,
        now: Instant,
        out: &mut PacketAssembler,
        acct: &mut SendAccounting,
    ) {
        match self {
            SenderChannel::Unreliable(ch) => ch.receive_ack(sequence),
            SenderChannel::Reliable(ch) => ch.receive_ack(sequence, now, out, acct),
        }
    }

    pub fn update_resend_delay(&mut self, average_rtt: Option<Duration>) {
        if let SenderChannel::Reliable(ch) = self {
            ch.resend_delay = resend_delay(average_rtt);
        }
    }

    /// True when nothing is queued or awaiting acknowledgement.
    pub fn is_drained(&self) -> bool {
        match self {
            SenderChannel::Unreliable(ch) => ch.queued.is_empty(),
            SenderChannel::Reliable(ch) => {
                ch.queued.is_empty() && ch.stored.iter().all(|s| s.is_none())
            }
        }
    }

    pub fn window_start(&self) -> u16 {
        match self {
            SenderChannel::Unreliable(ch) => ch.window_start,
            SenderChannel::Reliable(ch) => ch.window_start,
        }
    }

    pub fn next_send(&self) -> u16 {
        match self {
            SenderChannel::Unreliable(ch) => ch.next_send,
            SenderChannel::Reliable(ch) => ch.next_send,
        }
    }

    pub fn queued_len(&self) -> usize {
        match self {
            SenderChannel::Unreliable(ch) => ch.queued.len(),
            SenderChannel::Reliable(ch) => ch.queued.len(),
        }
    }

    /// Transmitted-but-unacknowledged messages held for retransmission.
    pub fn stored_len(&self) -> usize {
        match self {
            SenderChannel::Unreliable(_) => 0,
            SenderChannel::Reliable(ch) => ch.stored.iter().filter(|s| s.is_some()).count(),
        }
    }
}

/// Fire-and-forget sender; overflow beyond the window is dropped.
#[derive(Debug)]
pub struct UnreliableSender {
    window_start: u16,
    window_size: u16,
    next_send: u16,
    queued: VecDeque<QueuedMessage>,
    early_acks: BitSet<ACK_WORDS>,
}

impl UnreliableSender {
    fn new(window_size: u16) -> Self {
        Self {
            window_start: 0,
            window_size,
            next_send: 0,
            queued: VecDeque::new(),
            early_acks: BitSet::new(),
        }
    }

    fn allowed_sends(&self) -> u16 {
        let in_flight = (self.next_send + SEQUENCE_SPACE - self.window_start) % SEQUENCE_SPACE;
        self.window_size - in_flight
    }

    fn enqueue(&mut self, msg: QueuedMessage, acct: &mut SendAccounting) -> SendResult {
        if self.queued.len() + 1 > self.allowed_sends() as usize {
            acct.dropped += 1;
            debug!(queued = self.queued.len(), "unreliable send window overflow, dropping");
            return SendResult::Dropped;
        }
        self.queued.push_back(msg);
        SendResult::Sent
    }

    fn send_queued(&mut self, out: &mut PacketAssembler, acct: &mut SendAccounting) {
        let mut allowed = self.allowed_sends();
        while allowed > 0 {
            let Some(msg) = self.queued.pop_front() else {
                break;
            };
            let seq = self.next_send;
            self.next_send = advance(self.next_send, 1);
            out.queue_message(&msg, seq);
            acct.sent += 1;
            acct.sent_bytes += msg.encoded_size() as u64;
            allowed -= 1;
        }
    }

    /// Sequenced receivers acknowledge everything; use the acks to release
    /// window space. An early ack is only marked and is consumed once the
    /// window start catches up to it. Late acknowledgements are ignored.
    fn receive_ack(&mut self, sequence: u16) {
        let relate = relative(sequence, self.window_start);
        if relate < 0 {
            return;
        }
        if relate == 0 {
            self.window_start = advance(self.window_start, 1);
            while self.early_acks.unset(self.window_start as usize) {
                self.window_start = advance(self.window_start, 1);
            }
            return;
        }
        if relative(sequence, self.next_send) >= 0 {
            // Acknowledges something never sent; a broken or hostile peer.
            return;
        }
        self.early_acks.set(sequence as usize);
    }
}

/// One transmitted, unacknowledged message in the reliable window.
#[derive(Debug)]
struct StoredMessage {
    msg: QueuedMessage,
    sequence: u16,
    last_sent: Instant,
    send_count: u32,
}

/// Store-until-acknowledged sender.
///
/// `stored[seq % window]` holds exactly the transmitted-but-unacknowledged
/// messages. Retransmission fires on the resend timer, and earlier via the
/// hole heuristic when a later sequence is acknowledged first.
#[derive(Debug)]
pub struct ReliableSender {
    window_start: u16,
    window_size: u16,
    next_send: u16,
    queued: VecDeque<QueuedMessage>,
    stored: Vec<Option<StoredMessage>>,
    early_acks: BitSet<ACK_WORDS>,
    resend_delay: Duration,
}

impl ReliableSender {
    fn new(window_size: u16) -> Self {
        Self {
            window_start: 0,
            window_size,
            next_send: 0,
            queued: VecDeque::new(),
            stored: (0..window_size).map(|_| None).collect(),
            early_acks: BitSet::new(),
            resend_delay: resend_delay(None),
        }
    }

    fn allowed_sends(&self) -> u16 {
        let in_flight = (self.next_send + SEQUENCE_SPACE - self.window_start) % SEQUENCE_SPACE;
        self.window_size - in_flight
    }

    fn enqueue(&mut self, msg: QueuedMessage) -> SendResult {
        let fits = self.queued.len() < self.allowed_sends() as usize;
        self.queued.push_back(msg);
        if fits {
            SendResult::Sent
        } else {
            SendResult::Queued
        }
    }

    fn send_queued(&mut self, now: Instant, out: &mut PacketAssembler, acct: &mut SendAccounting) {
        // Delay-based retransmission before fresh traffic.
        for slot in self.stored.iter_mut() {
            if let Some(stored) = slot {
                if now.duration_since(stored.last_sent) >= self.resend_delay {
                    out.queue_message(&stored.msg, stored.sequence);
                    stored.last_sent = now;
                    stored.send_count += 1;
                    acct.delay_resends += 1;
                }
            }
        }

        let mut allowed = self.allowed_sends();
        while allowed > 0 {
            let Some(msg) = self.queued.pop_front() else {
                break;
            };
            if msg.fragment.is_none() && msg.encoded_size() > out.mtu() {
                // Fragmentation upstream should have decomposed this.
                error!(
                    size = msg.encoded_size(),
                    mtu = out.mtu(),
                    "reliable message exceeds MTU at the enqueue path"
                );
            }
            let seq = self.next_send;
            self.next_send = advance(self.next_send, 1);
            out.queue_message(&msg, seq);
            acct.sent += 1;
            acct.sent_bytes += msg.encoded_size() as u64;
            self.stored[(seq % self.window_size) as usize] = Some(StoredMessage {
                msg,
                sequence: seq,
                last_sent: now,
                send_count: 1,
            });
            allowed -= 1;
        }
    }

    fn receive_ack(
        &mut self,
        sequence: u16,
        now: Instant,
        out: &mut PacketAssembler,
        acct: &mut SendAccounting,
    ) {
        let relate = relative(sequence, self.window_start);
        if relate < 0 {
            // Late or duplicate acknowledgement.
            return;
        }

        if relate == 0 {
            // On time: free the slot and advance through earlier early acks.
            self.stored[(self.window_start % self.window_size) as usize] = None;
            self.window_start = advance(self.window_start, 1);
            while self.early_acks.unset(self.window_start as usize) {
                self.stored[(self.window_start % self.window_size) as usize] = None;
                self.window_start = advance(self.window_start, 1);
            }
            return;
        }

        // Early acknowledgement of a sequence ahead of the window start.
        if relative(sequence, self.next_send) >= 0 {
            // Acknowledges something never sent; a broken or hostile peer.
            return;
        }
        self.early_acks.set(sequence as usize);
        self.stored[(sequence % self.window_size) as usize] = None;

        // Walk back toward the window start: anything sent exactly once and
        // quiet for a share of the resend delay is presumed lost.
        let threshold = self.resend_delay.mul_f32(HOLE_RESEND_FACTOR);
        let mut seq = sequence;
        loop {
            seq = (seq + SEQUENCE_SPACE - 1) % SEQUENCE_SPACE;
            if let Some(stored) = self.stored[(seq % self.window_size) as usize]
                .as_mut()
                .filter(|s| s.sequence == seq)
            {
                if stored.send_count == 1 && now.duration_since(stored.last_sent) >= threshold {
                    out.queue_message(&stored.msg, stored.sequence);
                    stored.last_sent = now;
                    stored.send_count += 1;
                    acct.hole_resends += 1;
                }
            }
            if seq == self.window_start {
                break;
            }
        }
    }
}
