//! The peer: socket ownership, the transport worker, connection multiplexing,
//! and the public send/receive API.
//!
//! A transport tick drains the socket, routes each datagram to its connection
//! (or to unconnected handling), then heartbeats every connection. All
//! per-connection state lives on the worker thread; user threads talk to it
//! through [`ConnectionHandle`] queues and the inbound channel.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::buffer::MsgBuffer;
use crate::config::{MessageClass, PeerConfig, UnreliableSizeMode};
use crate::connection::{Connection, ConnectionHandle, ConnectionStatus};
use crate::error::{SendResult, TransportError};
use crate::message::{BufferPool, IncomingKind, IncomingMessage, OutgoingMessage, QueuedMessage};
use crate::protocol::{
    encode_frame, DatagramParser, DeliveryMethod, HandshakeData, KIND_CONNECT, KIND_DISCONNECT,
    KIND_UNCONNECTED,
};
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::DatagramSink;

/// Worker tick interval, doubling as the socket read timeout.
const TICK: Duration = Duration::from_millis(1);
/// Ticks spent draining connections during shutdown before forcing teardown.
const SHUTDOWN_DRAIN_TICKS: u32 = 64;
/// Largest datagram the receive path will accept.
const RECV_BUFFER_BYTES: usize = 65536;

/// Sends datagrams through the bound UDP socket.
struct UdpSink<'a> {
    socket: &'a UdpSocket,
}

impl DatagramSink for UdpSink<'_> {
    fn send_datagram(&mut self, payload: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        match self.socket.send_to(payload, to) {
            Ok(_) => Ok(()),
            Err(err) => Err(TransportError::Socket(err.to_string())),
        }
    }
}

struct ConnectRequest {
    addr: SocketAddr,
    hail: Vec<u8>,
}

struct PeerShared {
    config: Arc<PeerConfig>,
    time: Arc<dyn TimeProvider>,
    inbound_tx: Sender<IncomingMessage>,
    inbound_rx: Receiver<IncomingMessage>,
    handles: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
    connect_requests: Mutex<Vec<ConnectRequest>>,
    unconnected_out: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_reason: Mutex<String>,
    local_addr: Mutex<Option<SocketAddr>>,
    pool: BufferPool,
    unique_id: i64,
}

/// A local transport endpoint.
pub struct Peer {
    shared: Arc<PeerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Result<Self, TransportError> {
        Self::with_time_provider(config, Arc::new(SystemTimeProvider))
    }

    pub fn with_time_provider(
        config: PeerConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = unbounded();
        let pool = BufferPool::new(config.use_message_recycling);
        let unique_id = rand::rngs::StdRng::from_entropy().next_u64() as i64;
        Ok(Self {
            shared: Arc::new(PeerShared {
                config: Arc::new(config),
                time,
                inbound_tx,
                inbound_rx,
                handles: RwLock::new(HashMap::new()),
                connect_requests: Mutex::new(Vec::new()),
                unconnected_out: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
                shutdown_reason: Mutex::new(String::new()),
                local_addr: Mutex::new(None),
                pool,
                unique_id,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Binds the socket and spawns the transport worker.
    pub fn start(&self) -> Result<(), TransportError> {
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let socket = UdpSocket::bind(("0.0.0.0", self.shared.config.port))
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        socket
            .set_read_timeout(Some(TICK))
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        let local = socket
            .local_addr()
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        *self.shared.local_addr.lock() = Some(local);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("gramlink-transport".into())
            .spawn(move || run_worker(shared, socket))
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        *self.worker.lock() = Some(handle);
        debug!(%local, "peer started");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    /// A fresh outgoing message, backed by pooled storage when recycling is
    /// enabled.
    pub fn create_message(&self) -> OutgoingMessage {
        let storage = self
            .shared
            .pool
            .take(self.shared.config.default_outgoing_message_capacity);
        OutgoingMessage::from_recycled(storage)
    }

    /// Begins a handshake with `addr`. Returns the connection handle
    /// immediately; watch for a `StatusChanged` message to learn the outcome.
    pub fn connect(
        &self,
        addr: SocketAddr,
        hail: Option<OutgoingMessage>,
    ) -> Result<ConnectionHandle, TransportError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TransportError::NotRunning);
        }
        if let Some(existing) = self.shared.handles.read().get(&addr) {
            return Ok(existing.clone());
        }
        let handle = ConnectionHandle::new(
            addr,
            ConnectionStatus::InitiatedConnect,
            self.shared.config.maximum_transmission_unit,
        );
        self.shared.handles.write().insert(addr, handle.clone());
        self.shared.connect_requests.lock().push(ConnectRequest {
            addr,
            hail: hail.map(|m| m.into_buffer().into_bytes()).unwrap_or_default(),
        });
        Ok(handle)
    }

    /// Hands a message to a connection for delivery.
    pub fn send_message(
        &self,
        msg: OutgoingMessage,
        connection: &ConnectionHandle,
        method: DeliveryMethod,
        channel: u8,
    ) -> SendResult {
        if channel >= method.channel_count() {
            warn!(channel, ?method, "channel out of range for delivery method");
            return SendResult::Dropped;
        }
        let status = connection.status();
        if matches!(
            status,
            ConnectionStatus::None | ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
        ) {
            return SendResult::FailedNotConnected;
        }

        let queued = QueuedMessage::from_outgoing(msg, method.to_kind(channel));
        if !method.is_reliable()
            && self.shared.config.unreliable_size_mode == UnreliableSizeMode::DropAboveMtu
            && queued.encoded_size() > connection.current_mtu()
        {
            return SendResult::Dropped;
        }

        let was_empty = {
            let mut pending = connection.shared.pending_sends.lock();
            let was_empty = pending.is_empty();
            pending.push_back(queued);
            was_empty
        };
        if status == ConnectionStatus::Connected && was_empty {
            SendResult::Sent
        } else {
            SendResult::Queued
        }
    }

    /// Sends one message to several connections; the payload is shared by
    /// reference count rather than copied per recipient.
    pub fn send_to_many(
        &self,
        msg: OutgoingMessage,
        connections: &[ConnectionHandle],
        method: DeliveryMethod,
        channel: u8,
    ) -> SendResult {
        if connections.is_empty() {
            return SendResult::NoRecipients;
        }
        if channel >= method.channel_count() {
            warn!(channel, ?method, "channel out of range for delivery method");
            return SendResult::Dropped;
        }
        let queued = QueuedMessage::from_outgoing(msg, method.to_kind(channel));
        let mut best = SendResult::FailedNotConnected;
        for connection in connections {
            let status = connection.status();
            if matches!(
                status,
                ConnectionStatus::None
                    | ConnectionStatus::Disconnecting
                    | ConnectionStatus::Disconnected
            ) {
                continue;
            }
            connection.shared.pending_sends.lock().push_back(queued.clone());
            best = if status == ConnectionStatus::Connected {
                SendResult::Sent
            } else {
                SendResult::Queued
            };
        }
        best
    }

    /// Sends connectionless data to an arbitrary endpoint.
    pub fn send_unconnected(
        &self,
        msg: OutgoingMessage,
        to: SocketAddr,
    ) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TransportError::NotRunning);
        }
        let buffer = msg.into_buffer();
        let mut datagram = Vec::with_capacity(buffer.len_bytes() + 8);
        encode_frame(
            &mut datagram,
            KIND_UNCONNECTED,
            0,
            None,
            buffer.len_bits(),
            buffer.as_bytes(),
        );
        self.shared.unconnected_out.lock().push((datagram, to));
        Ok(())
    }

    /// Blocks up to `timeout` for the next inbound message. The only
    /// blocking call in the API.
    pub fn take_inbound(&self, timeout: Duration) -> Option<IncomingMessage> {
        self.shared.inbound_rx.recv_timeout(timeout).ok()
    }

    pub fn poll_inbound(&self) -> Option<IncomingMessage> {
        self.shared.inbound_rx.try_recv().ok()
    }

    /// Returns a consumed message's storage to the buffer pool.
    pub fn recycle(&self, msg: IncomingMessage) {
        self.shared.pool.put(msg.into_storage());
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared.handles.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.handles.read().len()
    }

    pub fn disconnect(&self, connection: &ConnectionHandle, reason: &str) {
        connection.request_disconnect(reason);
    }

    /// Drains connections for a bounded interval, then stops the worker.
    pub fn shutdown(&self, reason: &str) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.shared.shutdown_reason.lock() = reason.to_string();
        self.shared.shutdown_requested.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown("peer dropped");
    }
}

fn run_worker(shared: Arc<PeerShared>, socket: UdpSocket) {
    let mut connections: HashMap<SocketAddr, Connection> = HashMap::new();
    let mut sink = UdpSink { socket: &socket };
    let mut recv_buf = vec![0u8; RECV_BUFFER_BYTES];
    let mut rng = rand::rngs::StdRng::from_entropy();

    loop {
        let now = shared.time.now_instant();

        // Receive drain; the blocking read doubles as the tick sleep.
        loop {
            match socket.recv_from(&mut recv_buf) {
                Ok((len, from)) => {
                    route_datagram(
                        &shared,
                        &mut connections,
                        &mut sink,
                        &recv_buf[..len],
                        from,
                        &mut rng,
                    );
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    break;
                }
                Err(err) => {
                    warn!(%err, "socket receive failed");
                    break;
                }
            }
        }

        // Handshakes the application asked for.
        let requests: Vec<ConnectRequest> = shared.connect_requests.lock().drain(..).collect();
        for request in requests {
            if connections.contains_key(&request.addr) {
                continue;
            }
            let handle = shared
                .handles
                .read()
                .get(&request.addr)
                .cloned()
                .unwrap_or_else(|| {
                    ConnectionHandle::new(
                        request.addr,
                        ConnectionStatus::InitiatedConnect,
                        shared.config.maximum_transmission_unit,
                    )
                });
            let connection = Connection::new_outgoing(
                request.addr,
                handle,
                Arc::clone(&shared.config),
                Arc::clone(&shared.time),
                shared.inbound_tx.clone(),
                shared.unique_id,
                request.hail,
                now,
                rng.next_u64(),
                &mut sink,
            );
            connections.insert(request.addr, connection);
        }

        // Connectionless traffic.
        let unconnected: Vec<(Vec<u8>, SocketAddr)> =
            shared.unconnected_out.lock().drain(..).collect();
        for (datagram, to) in unconnected {
            if let Err(err) = sink.send_datagram(&datagram, to) {
                warn!(%to, %err, "failed to send unconnected datagram");
            }
        }

        for connection in connections.values_mut() {
            connection.heartbeat(&mut sink, now);
        }

        connections.retain(|addr, connection| {
            if connection.status() == ConnectionStatus::Disconnected {
                shared.handles.write().remove(addr);
                false
            } else {
                true
            }
        });

        if shared.shutdown_requested.load(Ordering::Acquire) {
            let reason = shared.shutdown_reason.lock().clone();
            for connection in connections.values_mut() {
                connection.handle().request_disconnect(&reason);
            }
            for _ in 0..SHUTDOWN_DRAIN_TICKS {
                if connections
                    .values()
                    .all(|c| c.status() == ConnectionStatus::Disconnected)
                {
                    break;
                }
                let now = shared.time.now_instant();
                for connection in connections.values_mut() {
                    connection.heartbeat(&mut sink, now);
                }
                std::thread::sleep(TICK);
            }
            let now = shared.time.now_instant();
            for connection in connections.values_mut() {
                connection.execute_disconnect(&reason, true, &mut sink, now);
            }
            shared.handles.write().clear();
            break;
        }
    }
    debug!("transport worker stopped");
}

fn route_datagram(
    shared: &Arc<PeerShared>,
    connections: &mut HashMap<SocketAddr, Connection>,
    sink: &mut UdpSink<'_>,
    data: &[u8],
    from: SocketAddr,
    rng: &mut rand::rngs::StdRng,
) {
    let now = shared.time.now_instant();
    if let Some(connection) = connections.get_mut(&from) {
        connection.handle_datagram(data, sink, now);
        return;
    }

    let mut parser = DatagramParser::new(data);
    match parser.next_message() {
        Ok(Some(message)) if message.kind == KIND_CONNECT => {
            accept_incoming(shared, connections, sink, message.payload, message.bit_length, from, rng);
        }
        Ok(Some(message)) if message.kind == KIND_UNCONNECTED => {
            if shared.config.is_class_enabled(MessageClass::UnconnectedData) {
                let buffer = MsgBuffer::from_bytes_with_bit_length(
                    message.payload.to_vec(),
                    message.bit_length,
                );
                let _ = shared.inbound_tx.send(IncomingMessage::new(
                    IncomingKind::UnconnectedData,
                    buffer,
                    None,
                    Some(from),
                    now,
                ));
            }
        }
        Ok(Some(message)) => {
            debug!(%from, kind = message.kind, "ignoring library message from unknown endpoint");
        }
        Ok(None) => {}
        Err(err) => {
            warn!(%from, %err, "dropping malformed datagram from unknown endpoint");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_incoming(
    shared: &Arc<PeerShared>,
    connections: &mut HashMap<SocketAddr, Connection>,
    sink: &mut UdpSink<'_>,
    payload: &[u8],
    bit_length: usize,
    from: SocketAddr,
    rng: &mut rand::rngs::StdRng,
) {
    let now = shared.time.now_instant();
    if !shared.config.accept_incoming_connections {
        debug!(%from, "refusing connect; incoming connections disabled");
        return;
    }
    if connections.len() >= shared.config.maximum_connections as usize {
        refuse(sink, from, "server full");
        return;
    }
    let mut buffer = MsgBuffer::from_bytes_with_bit_length(payload.to_vec(), bit_length);
    let handshake = match HandshakeData::decode(&mut buffer) {
        Ok(handshake) => handshake,
        Err(err) => {
            warn!(%from, %err, "dropping malformed connect");
            return;
        }
    };
    let handle = ConnectionHandle::new(
        from,
        ConnectionStatus::None,
        shared.config.maximum_transmission_unit,
    );
    shared.handles.write().insert(from, handle.clone());
    let connection = Connection::new_incoming(
        from,
        handle,
        Arc::clone(&shared.config),
        Arc::clone(&shared.time),
        shared.inbound_tx.clone(),
        shared.unique_id,
        handshake,
        now,
        rng.next_u64(),
        sink,
    );
    // A refused candidate (wrong application identifier) latches
    // Disconnected during construction and is never tracked.
    if connection.status() == ConnectionStatus::Disconnected {
        shared.handles.write().remove(&from);
        return;
    }
    connections.insert(from, connection);
}

/// Sends a bare Disconnect to an endpoint we will not track.
fn refuse(sink: &mut UdpSink<'_>, to: SocketAddr, reason: &str) {
    let mut payload = MsgBuffer::new();
    payload.write_str(reason);
    let mut datagram = Vec::with_capacity(payload.len_bytes() + 8);
    encode_frame(
        &mut datagram,
        KIND_DISCONNECT,
        0,
        None,
        payload.len_bits(),
        payload.as_bytes(),
    );
    if let Err(err) = sink.send_datagram(&datagram, to) {
        warn!(%to, %err, "failed to send refusal");
    }
}
