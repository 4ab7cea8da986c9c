//! Per-connection state: handshake lifecycle, ping/pong and round-trip
//! estimation, MTU probing, the acknowledgement queues, and the heartbeat
//! that assembles coalesced datagrams.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::assembler::PacketAssembler;
use crate::buffer::MsgBuffer;
use crate::channel::sender::{SendAccounting, DEFAULT_RTT};
use crate::channel::{ChannelMessage, ReceiverChannel, SenderChannel};
use crate::config::{MessageClass, PeerConfig, UnreliableSizeMode};
use crate::error::{SendResult, TransportError};
use crate::fragment::FragmentAssembler;
use crate::message::{IncomingKind, IncomingMessage, QueuedMessage, StatsSnapshot};
use crate::protocol::{
    channel_slot, decode_acks, decode_disconnect, decode_established, decode_pong,
    encode_acks, encode_disconnect, encode_established, encode_frame, encode_ping, encode_pong,
    is_user_kind, DatagramParser, DeliveryMethod, HandshakeData, ParsedMessage, ACK_ENTRY_BYTES,
    BASE_HEADER_BYTES, CHANNEL_SLOTS, KIND_ACKNOWLEDGE, KIND_CONNECT, KIND_CONNECTION_ESTABLISHED,
    KIND_CONNECT_RESPONSE, KIND_DISCONNECT, KIND_MTU_PROBE, KIND_MTU_PROBE_SUCCESS, KIND_PING,
    KIND_PONG, MAX_UNFRAGMENTED_BYTES,
};
use crate::mtu::{MtuAction, MtuDiscovery};
use crate::time::TimeProvider;
use crate::DatagramSink;

/// Weight of the previous estimate in the round-trip average.
const RTT_SMOOTHING: f32 = 0.7;
/// Heartbeats between the coarse checks (timeout, ping, MTU, disconnect).
const COARSE_INTERVAL: u32 = 8;
/// Heartbeats between acknowledgement drains.
const ACK_INTERVAL: u32 = 4;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No handshake traffic yet.
    None = 0,
    /// We sent Connect and await a response.
    InitiatedConnect = 1,
    /// A Connect arrived and is being examined.
    ReceivedInitiation = 2,
    /// The application decides whether to accept the remote peer.
    RespondedAwaitingApproval = 3,
    /// We sent ConnectResponse and await ConnectionEstablished.
    RespondedConnect = 4,
    Connected = 5,
    Disconnecting = 6,
    Disconnected = 7,
}

impl ConnectionStatus {
    pub(crate) fn from_u8(value: u8) -> ConnectionStatus {
        match value {
            1 => ConnectionStatus::InitiatedConnect,
            2 => ConnectionStatus::ReceivedInitiation,
            3 => ConnectionStatus::RespondedAwaitingApproval,
            4 => ConnectionStatus::RespondedConnect,
            5 => ConnectionStatus::Connected,
            6 => ConnectionStatus::Disconnecting,
            7 => ConnectionStatus::Disconnected,
            _ => ConnectionStatus::None,
        }
    }
}

/// Traffic counters, shared between the transport worker and handle readers.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    delay_resends: AtomicU64,
    hole_resends: AtomicU64,
    dropped_messages: AtomicU64,
}

impl ConnectionStats {
    fn merge(&self, acct: &SendAccounting) {
        self.sent_messages.fetch_add(acct.sent, Ordering::Relaxed);
        self.sent_bytes.fetch_add(acct.sent_bytes, Ordering::Relaxed);
        self.delay_resends.fetch_add(acct.delay_resends, Ordering::Relaxed);
        self.hole_resends.fetch_add(acct.hole_resends, Ordering::Relaxed);
        self.dropped_messages.fetch_add(acct.dropped, Ordering::Relaxed);
    }

    fn count_received(&self, bytes: usize) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            delay_resends: self.delay_resends.load(Ordering::Relaxed),
            hole_resends: self.hole_resends.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

/// The application's answer to a connection approval request.
#[derive(Debug)]
pub(crate) enum ApprovalDecision {
    Approve { hail: Vec<u8> },
    Deny { reason: String },
}

#[derive(Debug)]
pub(crate) struct HandleShared {
    remote: SocketAddr,
    status: AtomicU8,
    /// Microseconds; `u64::MAX` means no measurement yet.
    avg_rtt_us: AtomicU64,
    clock_offset_ms: AtomicI64,
    current_mtu: AtomicUsize,
    remote_unique_id: AtomicI64,
    stats: ConnectionStats,
    pub(crate) pending_sends: Mutex<VecDeque<QueuedMessage>>,
    disconnect_request: Mutex<Option<String>>,
    approval: Mutex<Option<ApprovalDecision>>,
    remote_hail: Mutex<Option<Vec<u8>>>,
    flush_requested: AtomicBool,
}

/// Shared view of one connection, safe to use from any thread.
///
/// All mutation happens on the transport worker; the handle only reads
/// snapshots and enqueues requests for the worker to consume.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub(crate) shared: Arc<HandleShared>,
}

impl ConnectionHandle {
    pub fn new(remote: SocketAddr, status: ConnectionStatus, mtu: usize) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                remote,
                status: AtomicU8::new(status as u8),
                avg_rtt_us: AtomicU64::new(u64::MAX),
                clock_offset_ms: AtomicI64::new(0),
                current_mtu: AtomicUsize::new(mtu),
                remote_unique_id: AtomicI64::new(0),
                stats: ConnectionStats::default(),
                pending_sends: Mutex::new(VecDeque::new()),
                disconnect_request: Mutex::new(None),
                approval: Mutex::new(None),
                remote_hail: Mutex::new(None),
                flush_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Smoothed round-trip time, `None` before the first pong.
    pub fn average_rtt(&self) -> Option<Duration> {
        match self.shared.avg_rtt_us.load(Ordering::Relaxed) {
            u64::MAX => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Estimated difference between the remote wall clock and ours.
    pub fn remote_clock_offset_ms(&self) -> i64 {
        self.shared.clock_offset_ms.load(Ordering::Relaxed)
    }

    pub fn current_mtu(&self) -> usize {
        self.shared.current_mtu.load(Ordering::Relaxed)
    }

    pub fn remote_unique_id(&self) -> i64 {
        self.shared.remote_unique_id.load(Ordering::Relaxed)
    }

    /// The hail payload the remote peer attached to its handshake.
    pub fn remote_hail(&self) -> Option<Vec<u8>> {
        self.shared.remote_hail.lock().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Accepts a connection surfaced as a `ConnectionApproval` message.
    pub fn approve(&self, hail: Option<crate::message::OutgoingMessage>) {
        let hail = hail.map(|m| m.into_buffer().into_bytes()).unwrap_or_default();
        *self.shared.approval.lock() = Some(ApprovalDecision::Approve { hail });
    }

    /// Rejects a connection surfaced as a `ConnectionApproval` message.
    pub fn deny(&self, reason: &str) {
        *self.shared.approval.lock() = Some(ApprovalDecision::Deny {
            reason: reason.to_string(),
        });
    }

    /// Asks the worker to tear the connection down on its next heartbeat.
    pub fn request_disconnect(&self, reason: &str) {
        *self.shared.disconnect_request.lock() = Some(reason.to_string());
    }

    /// Sends everything queued on the next heartbeat even when automatic
    /// flushing is disabled.
    pub fn request_flush(&self) {
        self.shared.flush_requested.store(true, Ordering::Release);
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn stats_ref(&self) -> &ConnectionStats {
        &self.shared.stats
    }
}

/// Worker-side state of one connection. Only the transport thread touches it.
pub struct Connection {
    remote: SocketAddr,
    handle: ConnectionHandle,
    config: Arc<PeerConfig>,
    time: Arc<dyn TimeProvider>,
    inbound: Sender<IncomingMessage>,
    status: ConnectionStatus,
    current_mtu: usize,

    send_channels: Vec<Option<SenderChannel>>,
    recv_channels: Vec<Option<ReceiverChannel>>,
    outgoing_acks: VecDeque<(u8, u16)>,
    incoming_acks: VecDeque<(u8, u16)>,
    assembler: PacketAssembler,
    defrag: FragmentAssembler,
    next_fragment_group: u32,

    local_unique_id: i64,
    local_hail: Vec<u8>,
    handshake_attempts: u8,
    last_handshake_send: Instant,

    avg_rtt: Option<Duration>,
    clock_offset_ms: i64,
    pongs_received: u32,
    ping_nr: u8,
    ping_sent_at: Instant,
    awaiting_pong: bool,
    next_ping: Instant,
    timeout_deadline: Instant,

    mtu: MtuDiscovery,
    heartbeat_count: u32,
    disconnect_pending: Option<(String, bool)>,
    rng: rand::rngs::StdRng,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        remote: SocketAddr,
        handle: ConnectionHandle,
        config: Arc<PeerConfig>,
        time: Arc<dyn TimeProvider>,
        inbound: Sender<IncomingMessage>,
        local_unique_id: i64,
        local_hail: Vec<u8>,
        now: Instant,
        rng_seed: u64,
    ) -> Self {
        let mtu = config.maximum_transmission_unit;
        let expand_frequency = config.expand_mtu_frequency;
        let fail_attempts = config.expand_mtu_fail_attempts;
        Self {
            remote,
            handle,
            config,
            time,
            inbound,
            status: ConnectionStatus::None,
            current_mtu: mtu,
            send_channels: (0..CHANNEL_SLOTS).map(|_| None).collect(),
            recv_channels: (0..CHANNEL_SLOTS).map(|_| None).collect(),
            outgoing_acks: VecDeque::new(),
            incoming_acks: VecDeque::new(),
            assembler: PacketAssembler::new(mtu),
            defrag: FragmentAssembler::new(),
            next_fragment_group: 1,
            local_unique_id,
            local_hail,
            handshake_attempts: 0,
            last_handshake_send: now,
            avg_rtt: None,
            clock_offset_ms: 0,
            pongs_received: 0,
            ping_nr: 0,
            ping_sent_at: now,
            awaiting_pong: false,
            next_ping: now,
            timeout_deadline: now + Duration::from_secs(3600),
            mtu: MtuDiscovery::new(expand_frequency, fail_attempts),
            heartbeat_count: 0,
            disconnect_pending: None,
            rng: rand::rngs::StdRng::seed_from_u64(rng_seed),
        }
    }

    /// Client side: created on an application connect call; sends Connect.
    #[allow(clippy::too_many_arguments)]
    pub fn new_outgoing(
        remote: SocketAddr,
        handle: ConnectionHandle,
        config: Arc<PeerConfig>,
        time: Arc<dyn TimeProvider>,
        inbound: Sender<IncomingMessage>,
        local_unique_id: i64,
        hail: Vec<u8>,
        now: Instant,
        rng_seed: u64,
        sink: &mut dyn DatagramSink,
    ) -> Self {
        let mut conn = Self::new(
            remote,
            handle,
            config,
            time,
            inbound,
            local_unique_id,
            hail,
            now,
            rng_seed,
        );
        conn.set_status(ConnectionStatus::InitiatedConnect, "connecting", now);
        conn.send_connect(sink, now);
        conn
    }

    /// Server side: created on an incoming Connect datagram.
    #[allow(clippy::too_many_arguments)]
    pub fn new_incoming(
        remote: SocketAddr,
        handle: ConnectionHandle,
        config: Arc<PeerConfig>,
        time: Arc<dyn TimeProvider>,
        inbound: Sender<IncomingMessage>,
        local_unique_id: i64,
        handshake: HandshakeData,
        now: Instant,
        rng_seed: u64,
        sink: &mut dyn DatagramSink,
    ) -> Self {
        let mut conn = Self::new(
            remote,
            handle,
            config,
            time,
            inbound,
            local_unique_id,
            Vec::new(),
            now,
            rng_seed,
        );
        conn.set_status(ConnectionStatus::ReceivedInitiation, "connect received", now);
        conn.accept_connect(handshake, now, sink);
        conn
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn stats(&self) -> &ConnectionStats {
        self.handle.stats_ref()
    }

    // --- status and inbound plumbing ---

    fn set_status(&mut self, status: ConnectionStatus, reason: &str, now: Instant) {
        if self.status == status {
            return;
        }
        debug!(remote = %self.remote, ?status, reason, "connection status changed");
        self.status = status;
        self.handle.set_status(status);
        if status == ConnectionStatus::Connected {
            self.init_connected(now);
        }
        self.emit(
            IncomingKind::StatusChanged {
                status,
                reason: reason.to_string(),
            },
            MsgBuffer::new(),
            MessageClass::StatusChanged,
            now,
        );
    }

    fn emit(&self, kind: IncomingKind, buffer: MsgBuffer, class: MessageClass, now: Instant) {
        if !self.config.is_class_enabled(class) {
            return;
        }
        let msg = IncomingMessage::new(kind, buffer, Some(self.handle.clone()), Some(self.remote), now);
        let _ = self.inbound.send(msg);
    }

    fn emit_warning(&self, text: String, now: Instant) {
        warn!(remote = %self.remote, "{text}");
        self.emit(
            IncomingKind::WarningMessage { text },
            MsgBuffer::new(),
            MessageClass::WarningMessage,
            now,
        );
    }

    // --- handshake ---

    fn handshake_payload(&self) -> MsgBuffer {
        let mut buf = MsgBuffer::new();
        HandshakeData {
            app_id: self.config.app_identifier.clone(),
            unique_id: self.local_unique_id,
            remote_time_ms: self.time.now_system_ms(),
            hail: self.local_hail.clone(),
        }
        .encode(&mut buf);
        buf
    }

    fn send_direct(&mut self, kind: u8, payload: &MsgBuffer, sink: &mut dyn DatagramSink) {
        let mut datagram = Vec::with_capacity(BASE_HEADER_BYTES + payload.len_bytes());
        encode_frame(
            &mut datagram,
            kind,
            0,
            None,
            payload.len_bits(),
            payload.as_bytes(),
        );
        if let Err(err) = sink.send_datagram(&datagram, self.remote) {
            warn!(remote = %self.remote, %err, "failed to send datagram");
        }
    }

    fn send_connect(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        let payload = self.handshake_payload();
        self.send_direct(KIND_CONNECT, &payload, sink);
        self.last_handshake_send = now;
        if self.handshake_attempts == 0 {
            self.handshake_attempts = 1;
        }
    }

    fn send_connect_response(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        let payload = self.handshake_payload();
        self.send_direct(KIND_CONNECT_RESPONSE, &payload, sink);
        self.last_handshake_send = now;
        if self.handshake_attempts == 0 {
            self.handshake_attempts = 1;
        }
    }

    fn send_established(&mut self, sink: &mut dyn DatagramSink) {
        let mut payload = MsgBuffer::new();
        encode_established(&mut payload, self.time.now_system_ms());
        self.send_direct(KIND_CONNECTION_ESTABLISHED, &payload, sink);
    }

    /// Examines a Connect payload and either responds, asks the application
    /// for approval, or refuses.
    fn accept_connect(&mut self, handshake: HandshakeData, now: Instant, sink: &mut dyn DatagramSink) {
        if handshake.app_id != self.config.app_identifier {
            self.execute_disconnect("wrong application identifier", true, sink, now);
            return;
        }
        self.handle
            .shared
            .remote_unique_id
            .store(handshake.unique_id, Ordering::Relaxed);
        *self.handle.shared.remote_hail.lock() = Some(handshake.hail.clone());

        if self.config.is_class_enabled(MessageClass::ConnectionApproval) {
            self.set_status(ConnectionStatus::RespondedAwaitingApproval, "awaiting approval", now);
            self.emit(
                IncomingKind::ConnectionApproval,
                MsgBuffer::from_bytes(handshake.hail),
                MessageClass::ConnectionApproval,
                now,
            );
        } else {
            self.send_connect_response(sink, now);
            self.set_status(ConnectionStatus::RespondedConnect, "responded to connect", now);
        }
    }

    fn init_connected(&mut self, now: Instant) {
        self.timeout_deadline = now + self.config.connection_timeout;
        let jitter = self.rng.gen_range(0.25..1.0);
        self.next_ping = now + self.config.ping_interval.mul_f64(jitter);
        if self.config.auto_expand_mtu {
            self.mtu.start(now, self.avg_rtt.unwrap_or(DEFAULT_RTT));
        }
    }

    // --- datagram intake ---

    pub fn handle_datagram(&mut self, data: &[u8], sink: &mut dyn DatagramSink, now: Instant) {
        let mut parser = DatagramParser::new(data);
        loop {
            match parser.next_message() {
                Ok(Some(message)) => self.handle_message(message, sink, now),
                Ok(None) => break,
                Err(err) => {
                    self.emit_warning(format!("dropping malformed datagram: {err}"), now);
                    break;
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        message: ParsedMessage<'_>,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) {
        if is_user_kind(message.kind) {
            self.handle_user_message(message, now);
            return;
        }
        if let Err(err) = self.handle_library_message(&message, sink, now) {
            self.emit_warning(
                format!("dropping malformed {} message: {err}", message.kind),
                now,
            );
        }
    }

    fn payload_buffer(message: &ParsedMessage<'_>) -> MsgBuffer {
        MsgBuffer::from_bytes_with_bit_length(message.payload.to_vec(), message.bit_length)
    }

    fn handle_library_message(
        &mut self,
        message: &ParsedMessage<'_>,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), TransportError> {
        match message.kind {
            KIND_CONNECT => {
                // A retransmitted Connect; the response must have been lost.
                if matches!(
                    self.status,
                    ConnectionStatus::RespondedConnect | ConnectionStatus::Connected
                ) {
                    self.send_connect_response(sink, now);
                }
            }
            KIND_CONNECT_RESPONSE => {
                let handshake = HandshakeData::decode(&mut Self::payload_buffer(message))?;
                self.on_connect_response(handshake, sink, now);
            }
            KIND_CONNECTION_ESTABLISHED => {
                let remote_ms = decode_established(&mut Self::payload_buffer(message))?;
                self.on_established(remote_ms, now);
            }
            KIND_DISCONNECT => {
                let reason = decode_disconnect(&mut Self::payload_buffer(message))?;
                self.execute_disconnect(&reason, false, sink, now);
            }
            KIND_PING => {
                let nr = Self::payload_buffer(message).read_u8()?;
                let mut payload = MsgBuffer::new();
                encode_pong(&mut payload, nr, self.time.now_system_ms());
                self.assembler.queue_raw(KIND_PONG, 0, payload.as_bytes());
            }
            KIND_PONG => {
                let (nr, remote_ms) = decode_pong(&mut Self::payload_buffer(message))?;
                self.on_pong(nr, remote_ms, now);
            }
            KIND_ACKNOWLEDGE => {
                let acks = decode_acks(message.payload, message.bit_length)?;
                self.incoming_acks.extend(acks);
            }
            KIND_MTU_PROBE => {
                // Echo the size so the prober learns the path carried it.
                let probe_size = BASE_HEADER_BYTES + message.bit_length.div_ceil(8);
                let mut payload = MsgBuffer::new();
                payload.write_u32(probe_size as u32);
                self.assembler
                    .queue_raw(KIND_MTU_PROBE_SUCCESS, 0, payload.as_bytes());
            }
            KIND_MTU_PROBE_SUCCESS => {
                let size = Self::payload_buffer(message).read_u32()? as usize;
                if let Some(new_mtu) = self.mtu.on_probe_success(size, now, self.current_mtu) {
                    self.current_mtu = new_mtu;
                    self.assembler.set_mtu(new_mtu);
                    self.handle
                        .shared
                        .current_mtu
                        .store(new_mtu, Ordering::Relaxed);
                }
            }
            other => {
                debug!(kind = other, "ignoring unknown library message");
            }
        }
        Ok(())
    }

    fn on_connect_response(
        &mut self,
        handshake: HandshakeData,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) {
        match self.status {
            ConnectionStatus::InitiatedConnect => {
                if handshake.app_id != self.config.app_identifier {
                    self.execute_disconnect("wrong application identifier", false, sink, now);
                    return;
                }
                self.handle
                    .shared
                    .remote_unique_id
                    .store(handshake.unique_id, Ordering::Relaxed);
                *self.handle.shared.remote_hail.lock() = Some(handshake.hail.clone());
                // The first response round-trip seeds the estimate.
                if self.handshake_attempts == 1 {
                    self.record_rtt(now.duration_since(self.last_handshake_send));
                }
                self.clock_offset_ms = handshake.remote_time_ms - self.time.now_system_ms();
                self.handle
                    .shared
                    .clock_offset_ms
                    .store(self.clock_offset_ms, Ordering::Relaxed);
                self.send_established(sink);
                self.set_status(ConnectionStatus::Connected, "connected", now);
            }
            ConnectionStatus::Connected => {
                // Our ConnectionEstablished was lost; repeat it.
                self.send_established(sink);
            }
            _ => {}
        }
    }

    fn on_established(&mut self, remote_ms: i64, now: Instant) {
        if self.status != ConnectionStatus::RespondedConnect {
            return;
        }
        self.clock_offset_ms = remote_ms - self.time.now_system_ms();
        self.handle
            .shared
            .clock_offset_ms
            .store(self.clock_offset_ms, Ordering::Relaxed);
        self.set_status(ConnectionStatus::Connected, "connected", now);
    }

    // --- ping, round-trip time, clock offset ---

    fn record_rtt(&mut self, sample: Duration) {
        let updated = match self.avg_rtt {
            None => sample,
            Some(avg) => avg.mul_f32(RTT_SMOOTHING) + sample.mul_f32(1.0 - RTT_SMOOTHING),
        };
        self.avg_rtt = Some(updated);
        self.handle
            .shared
            .avg_rtt_us
            .store(updated.as_micros() as u64, Ordering::Relaxed);
        for channel in self.send_channels.iter_mut().flatten() {
            channel.update_resend_delay(self.avg_rtt);
        }
    }

    fn on_pong(&mut self, nr: u8, remote_ms: i64, now: Instant) {
        if !self.awaiting_pong || nr != self.ping_nr {
            return;
        }
        self.awaiting_pong = false;
        let rtt = now.duration_since(self.ping_sent_at);
        self.record_rtt(rtt);
        self.pongs_received += 1;

        // Offset samples are averaged with weight on the accumulated history.
        let sample = remote_ms - self.time.now_system_ms() + rtt.as_millis() as i64 / 2;
        let count = self.pongs_received as i64;
        self.clock_offset_ms = (self.clock_offset_ms * (count - 1) + sample) / count;
        self.handle
            .shared
            .clock_offset_ms
            .store(self.clock_offset_ms, Ordering::Relaxed);

        self.timeout_deadline = now + self.config.connection_timeout;
        self.emit(
            IncomingKind::ConnectionLatencyUpdated { rtt },
            MsgBuffer::new(),
            MessageClass::ConnectionLatencyUpdated,
            now,
        );
    }

    fn send_ping(&mut self, now: Instant) {
        self.ping_nr = self.ping_nr.wrapping_add(1);
        self.ping_sent_at = now;
        self.awaiting_pong = true;
        self.next_ping = now + self.config.ping_interval;
        let mut payload = MsgBuffer::new();
        encode_ping(&mut payload, self.ping_nr);
        self.assembler.queue_raw(KIND_PING, 0, payload.as_bytes());
    }

    // --- user data intake ---

    fn handle_user_message(&mut self, message: ParsedMessage<'_>, now: Instant) {
        let Some((method, channel)) = DeliveryMethod::from_kind(message.kind) else {
            return;
        };
        if self.status != ConnectionStatus::Connected {
            debug!(remote = %self.remote, "user message before connected, dropping");
            return;
        }

        // Acknowledge unconditionally, whatever the channel decides below.
        self.outgoing_acks.push_back((message.kind, message.sequence));
        self.stats().count_received(message.payload.len());

        let slot = channel_slot(message.kind);
        if self.recv_channels[slot].is_none() {
            self.recv_channels[slot] = Some(ReceiverChannel::new_for(method));
        }
        let channel_msg = ChannelMessage {
            kind: message.kind,
            sequence: message.sequence,
            fragment: message.fragment,
            payload: message.payload.to_vec(),
            bit_length: message.bit_length,
        };

        let mut delivered: SmallVec<[ChannelMessage; 4]> = SmallVec::new();
        if let Some(recv) = self.recv_channels[slot].as_mut() {
            recv.receive(channel_msg, &mut |msg| delivered.push(msg));
        }

        for msg in delivered {
            self.deliver_user_message(msg, method, channel, now);
        }
    }

    fn deliver_user_message(
        &mut self,
        msg: ChannelMessage,
        method: DeliveryMethod,
        channel: u8,
        now: Instant,
    ) {
        let sequence = msg.sequence;
        let buffer = match msg.fragment {
            Some(header) => match self.defrag.insert(&header, &msg.payload) {
                Ok(Some(reassembled)) => reassembled,
                Ok(None) => return,
                Err(err) => {
                    self.emit_warning(format!("dropping bad fragment: {err}"), now);
                    return;
                }
            },
            None => MsgBuffer::from_bytes_with_bit_length(msg.payload, msg.bit_length),
        };
        self.emit(
            IncomingKind::Data {
                method,
                channel,
                sequence,
            },
            buffer,
            MessageClass::Data,
            now,
        );
    }

    // --- outbound path ---

    /// Moves one application message onto its sender channel, fragmenting when
    /// it cannot fit a datagram.
    pub fn enqueue_outgoing(&mut self, msg: QueuedMessage) -> SendResult {
        let Some((method, _)) = DeliveryMethod::from_kind(msg.kind) else {
            return SendResult::Dropped;
        };
        let slot = channel_slot(msg.kind);
        let mut acct = SendAccounting::default();

        let result = if msg.encoded_size() > self.current_mtu {
            let fragments_allowed = method.is_reliable()
                || self.config.unreliable_size_mode == UnreliableSizeMode::NormalFragmentation;
            if fragments_allowed {
                let group = self.next_fragment_group;
                self.next_fragment_group = self.next_fragment_group.wrapping_add(1).max(1);
                let chunks = msg.split_fragments(self.current_mtu, group);
                let channel = self.send_channel_mut(slot, method);
                let mut result = SendResult::Sent;
                for chunk in chunks {
                    result = channel.enqueue(chunk, &mut acct);
                }
                result
            } else if self.config.unreliable_size_mode == UnreliableSizeMode::DropAboveMtu {
                acct.dropped += 1;
                SendResult::Dropped
            } else if msg.bit_length.div_ceil(8) > MAX_UNFRAGMENTED_BYTES {
                // IgnoreMtu still cannot express this in the frame header.
                warn!(
                    bytes = msg.bit_length.div_ceil(8),
                    "unfragmented message exceeds the frame size limit, dropping"
                );
                acct.dropped += 1;
                SendResult::Dropped
            } else {
                self.send_channel_mut(slot, method).enqueue(msg, &mut acct)
            }
        } else {
            self.send_channel_mut(slot, method).enqueue(msg, &mut acct)
        };

        self.stats().merge(&acct);
        result
    }

    fn send_channel_mut(&mut self, slot: usize, method: DeliveryMethod) -> &mut SenderChannel {
        let entry = &mut self.send_channels[slot];
        if entry.is_none() {
            let mut channel = SenderChannel::new_for(method);
            channel.update_resend_delay(self.avg_rtt);
            *entry = Some(channel);
        }
        entry.as_mut().expect("just created")
    }

    // --- heartbeat ---

    pub fn heartbeat(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.heartbeat_count = self.heartbeat_count.wrapping_add(1);

        self.consume_handle_requests(sink, now);

        if self.heartbeat_count % COARSE_INTERVAL == 0 {
            self.coarse_heartbeat(sink, now);
            if self.status == ConnectionStatus::Disconnected {
                return;
            }
        }

        if self.heartbeat_count % ACK_INTERVAL == 0 {
            self.drain_outgoing_acks();
            self.drain_incoming_acks(now);
        }

        if self.config.auto_flush_send_queue
            || self.handle.shared.flush_requested.swap(false, Ordering::AcqRel)
        {
            self.flush_send_queues(now);
        }

        self.flush_datagrams(sink);
    }

    fn consume_handle_requests(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        if let Some(reason) = self.handle.shared.disconnect_request.lock().take() {
            self.disconnect_pending = Some((reason, true));
        }

        if self.status == ConnectionStatus::RespondedAwaitingApproval {
            let decision = self.handle.shared.approval.lock().take();
            if let Some(decision) = decision {
                match decision {
                    ApprovalDecision::Approve { hail } => {
                        self.local_hail = hail;
                        self.send_connect_response(sink, now);
                        self.set_status(ConnectionStatus::RespondedConnect, "approved", now);
                    }
                    ApprovalDecision::Deny { reason } => {
                        self.execute_disconnect(&reason, true, sink, now);
                    }
                }
            }
        }

        // Drain application sends into the channels.
        let pending: Vec<QueuedMessage> = {
            let mut queue = self.handle.shared.pending_sends.lock();
            queue.drain(..).collect()
        };
        for msg in pending {
            self.enqueue_outgoing(msg);
        }
    }

    fn coarse_heartbeat(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        match self.status {
            ConnectionStatus::Connected => {
                if now > self.timeout_deadline {
                    self.execute_disconnect("connection timed out", true, sink, now);
                    return;
                }
                if now >= self.next_ping {
                    self.send_ping(now);
                }
                self.mtu_heartbeat(sink, now);
            }
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                self.handshake_heartbeat(sink, now);
            }
            _ => {}
        }

        if let Some((reason, farewell)) = self.disconnect_pending.take() {
            self.execute_disconnect(&reason, farewell, sink, now);
        }
    }

    fn handshake_heartbeat(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        if now.duration_since(self.last_handshake_send) < self.config.resend_handshake_interval {
            return;
        }
        if self.handshake_attempts >= self.config.maximum_handshake_attempts {
            self.execute_disconnect("no response from remote host", false, sink, now);
            return;
        }
        self.handshake_attempts += 1;
        match self.status {
            ConnectionStatus::InitiatedConnect => self.send_connect(sink, now),
            ConnectionStatus::RespondedConnect => self.send_connect_response(sink, now),
            _ => {}
        }
    }

    fn mtu_heartbeat(&mut self, sink: &mut dyn DatagramSink, now: Instant) {
        if !self.config.auto_expand_mtu {
            return;
        }
        if let MtuAction::SendProbe(size) = self.mtu.heartbeat(now, self.current_mtu) {
            let mut datagram = Vec::with_capacity(size);
            let payload = vec![0u8; size - BASE_HEADER_BYTES];
            encode_frame(
                &mut datagram,
                KIND_MTU_PROBE,
                0,
                None,
                payload.len() * 8,
                &payload,
            );
            match sink.send_datagram(&datagram, self.remote) {
                Ok(()) => self.mtu.on_probe_sent(size, now),
                Err(err) => {
                    debug!(size, %err, "MTU probe rejected by the socket");
                    self.mtu.on_send_failure(size, now);
                }
            }
        }
    }

    fn drain_outgoing_acks(&mut self) {
        while !self.outgoing_acks.is_empty() {
            let space = self.assembler.remaining();
            if space < BASE_HEADER_BYTES + ACK_ENTRY_BYTES {
                self.assembler.flush_pending();
                continue;
            }
            let max_entries = (space - BASE_HEADER_BYTES) / ACK_ENTRY_BYTES;
            let count = max_entries.min(self.outgoing_acks.len());
            let batch: Vec<(u8, u16)> = self.outgoing_acks.drain(..count).collect();
            let payload = encode_acks(&batch);
            self.assembler.queue_raw(KIND_ACKNOWLEDGE, 0, &payload);
        }
    }

    fn drain_incoming_acks(&mut self, now: Instant) {
        let mut acct = SendAccounting::default();
        while let Some((kind, sequence)) = self.incoming_acks.pop_front() {
            if !is_user_kind(kind) {
                continue;
            }
            let slot = channel_slot(kind);
            if let Some(channel) = self.send_channels[slot].as_mut() {
                channel.receive_ack(sequence, now, &mut self.assembler, &mut acct);
            }
        }
        self.stats().merge(&acct);
    }

    /// Walks the send channels in reverse slot order so the reliable family
    /// (highest kinds) gets at the datagram budget first.
    fn flush_send_queues(&mut self, now: Instant) {
        if !matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting
        ) {
            return;
        }
        let mut acct = SendAccounting::default();
        let Self {
            send_channels,
            assembler,
            ..
        } = self;
        for channel in send_channels.iter_mut().rev().flatten() {
            channel.send_queued(now, assembler, &mut acct);
        }
        self.stats().merge(&acct);
    }

    fn flush_datagrams(&mut self, sink: &mut dyn DatagramSink) {
        for datagram in self.assembler.take_datagrams() {
            if let Err(err) = sink.send_datagram(&datagram, self.remote) {
                warn!(remote = %self.remote, %err, "failed to send datagram");
            }
        }
    }

    // --- teardown ---

    /// Flushes what can still be sent, optionally says goodbye, and latches
    /// the Disconnected status. The peer drops the connection afterwards.
    pub fn execute_disconnect(
        &mut self,
        reason: &str,
        farewell: bool,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        let was_active = matches!(
            self.status,
            ConnectionStatus::Connected
                | ConnectionStatus::RespondedConnect
                | ConnectionStatus::RespondedAwaitingApproval
        );
        self.set_status(ConnectionStatus::Disconnecting, reason, now);

        if was_active {
            self.flush_send_queues(now);
            self.drain_outgoing_acks();
            self.flush_datagrams(sink);
        }
        if farewell {
            let mut payload = MsgBuffer::new();
            encode_disconnect(&mut payload, reason);
            self.send_direct(KIND_DISCONNECT, &payload, sink);
        }
        self.handle.shared.pending_sends.lock().clear();
        self.set_status(ConnectionStatus::Disconnected, reason, now);
    }

    /// True when every channel has delivered its queue; used by shutdown.
    pub fn is_drained(&self) -> bool {
        self.send_channels
            .iter()
            .flatten()
            .all(|channel| channel.is_drained())
            && self.assembler.is_idle()
            && self.outgoing_acks.is_empty()
    }
}
