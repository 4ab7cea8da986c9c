//! End-to-end tests over real loopback UDP sockets.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use gramlink::{
    ConnectionStatus, DeliveryMethod, IncomingKind, MessageClass, Peer, PeerConfig, SendResult,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback_addr(peer: &Peer) -> SocketAddr {
    let port = peer.local_addr().expect("peer not started").port();
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

fn server_config() -> PeerConfig {
    let mut config = PeerConfig::new("gramlink-e2e");
    config.accept_incoming_connections = true;
    config
}

fn wait_for_data(peer: &Peer, deadline: Duration) -> Option<gramlink::IncomingMessage> {
    let mut waited = Duration::ZERO;
    let step = Duration::from_millis(100);
    while waited < deadline {
        if let Some(msg) = peer.take_inbound(step) {
            if matches!(msg.kind(), IncomingKind::Data { .. }) {
                return Some(msg);
            }
            continue;
        }
        waited += step;
    }
    None
}

/// Two peers on loopback exchange one reliable-ordered message. The receiver
/// observes the connected notification before the data.
#[test]
fn test_loopback_reliable_ordered_hello() {
    init_tracing();
    let server = Peer::new(server_config()).unwrap();
    server.start().unwrap();
    let client = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    client.start().unwrap();

    let conn = client.connect(loopback_addr(&server), None).unwrap();

    let mut msg = client.create_message();
    msg.write_str("hello");
    let result = client.send_message(msg, &conn, DeliveryMethod::ReliableOrdered, 0);
    assert_ne!(result, SendResult::FailedNotConnected);

    // The server must report the new connection before its data.
    let mut saw_connected = false;
    let mut body = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        let Some(mut incoming) = server.take_inbound(Duration::from_millis(200)) else {
            continue;
        };
        match incoming.kind().clone() {
            IncomingKind::StatusChanged { status, .. } => {
                if status == ConnectionStatus::Connected {
                    saw_connected = true;
                }
            }
            IncomingKind::Data { method, .. } => {
                assert!(saw_connected, "data before the connected notification");
                assert_eq!(method, DeliveryMethod::ReliableOrdered);
                body = Some(incoming.read_str().unwrap());
                break;
            }
            _ => {}
        }
    }
    assert_eq!(body.as_deref(), Some("hello"));
    assert_eq!(conn.status(), ConnectionStatus::Connected);

    client.shutdown("done");
    server.shutdown("done");
}

#[test]
fn test_loopback_bidirectional_traffic() {
    init_tracing();
    let server = Peer::new(server_config()).unwrap();
    server.start().unwrap();
    let client = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    client.start().unwrap();

    let conn = client.connect(loopback_addr(&server), None).unwrap();

    let mut msg = client.create_message();
    msg.write_str("marco");
    client.send_message(msg, &conn, DeliveryMethod::ReliableOrdered, 0);

    let mut first = wait_for_data(&server, Duration::from_secs(10)).expect("no data at server");
    assert_eq!(first.read_str().unwrap(), "marco");

    // Answer over the server's handle for this client.
    let back = first.sender().expect("data must carry its sender").clone();
    let mut reply = server.create_message();
    reply.write_str("polo");
    server.send_message(reply, &back, DeliveryMethod::ReliableOrdered, 0);

    let mut answer = wait_for_data(&client, Duration::from_secs(10)).expect("no reply at client");
    assert_eq!(answer.read_str().unwrap(), "polo");

    client.shutdown("done");
    server.shutdown("done");
}

#[test]
fn test_loopback_fragmented_payload() {
    init_tracing();
    let server = Peer::new(server_config()).unwrap();
    server.start().unwrap();
    let client = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    client.start().unwrap();

    let conn = client.connect(loopback_addr(&server), None).unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    let mut msg = client.create_message();
    msg.write_bytes(&payload);
    client.send_message(msg, &conn, DeliveryMethod::ReliableOrdered, 1);

    let mut received = wait_for_data(&server, Duration::from_secs(10)).expect("no data");
    assert_eq!(received.len_bytes(), payload.len());
    assert_eq!(received.read_bytes(payload.len()).unwrap(), payload);

    client.shutdown("done");
    server.shutdown("done");
}

#[test]
fn test_loopback_unconnected_data() {
    init_tracing();
    let mut receiver_cfg = PeerConfig::new("gramlink-e2e");
    receiver_cfg.enable_class(MessageClass::UnconnectedData);
    let receiver = Peer::new(receiver_cfg).unwrap();
    receiver.start().unwrap();
    let sender = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    sender.start().unwrap();

    let mut msg = sender.create_message();
    msg.write_str("out of band");
    sender.send_unconnected(msg, loopback_addr(&receiver)).unwrap();

    let mut got = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Some(mut incoming) = receiver.take_inbound(Duration::from_millis(100)) {
            if matches!(incoming.kind(), IncomingKind::UnconnectedData) {
                assert!(incoming.sender_addr().is_some());
                got = Some(incoming.read_str().unwrap());
                break;
            }
        }
    }
    assert_eq!(got.as_deref(), Some("out of band"));

    sender.shutdown("done");
    receiver.shutdown("done");
}

#[test]
fn test_send_without_connection_fails() {
    init_tracing();
    let server = Peer::new(server_config()).unwrap();
    server.start().unwrap();
    let client = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    client.start().unwrap();

    let conn = client.connect(loopback_addr(&server), None).unwrap();
    client.disconnect(&conn, "changed my mind");

    // Give the worker time to tear the connection down.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while conn.status() != ConnectionStatus::Disconnected
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);

    let mut msg = client.create_message();
    msg.write_str("too late");
    assert_eq!(
        client.send_message(msg, &conn, DeliveryMethod::ReliableOrdered, 0),
        SendResult::FailedNotConnected
    );

    client.shutdown("done");
    server.shutdown("done");
}

#[test]
fn test_take_inbound_times_out_empty() {
    init_tracing();
    let peer = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    peer.start().unwrap();
    let started = std::time::Instant::now();
    assert!(peer.take_inbound(Duration::from_millis(150)).is_none());
    assert!(started.elapsed() >= Duration::from_millis(140));
    peer.shutdown("done");
}

#[test]
fn test_connect_requires_started_peer() {
    let peer = Peer::new(PeerConfig::new("gramlink-e2e")).unwrap();
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(peer.connect(addr, None).is_err());
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = PeerConfig::new("gramlink-e2e");
    config.maximum_transmission_unit = 100;
    assert!(Peer::new(config).is_err());

    let empty_app = PeerConfig::new("");
    assert!(Peer::new(empty_app).is_err());
}
