//! Datagram channel tests over mock sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hop_channel::transport::mock::MockDatagramSocket;
use hop_channel::{
    ChannelEventKind, CloseReason, DatagramChannel, DatagramChannelConfig, DatagramCryptor,
    DatagramEndpoint, Error, EventReceiver, PacketChannel, PeerRole, SessionId, SessionKey,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CLIENT_ADDR: &str = "192.0.2.1:40000";
const SERVER_ADDR: &str = "198.51.100.1:4500";

struct Setup {
    client_socket: Arc<MockDatagramSocket>,
    server_socket: Arc<MockDatagramSocket>,
    client_endpoint: DatagramEndpoint,
    server_endpoint: DatagramEndpoint,
    client: DatagramChannel,
    client_events: EventReceiver,
    server: DatagramChannel,
    server_events: EventReceiver,
}

fn setup() -> Setup {
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();
    let (client_socket, server_socket) = MockDatagramSocket::pair(client_addr, server_addr);

    let session = SessionId::new(0x5EED);
    let key = SessionKey::from_secret(b"datagram-channel-test");

    let client_endpoint = DatagramEndpoint::new(client_socket.clone());
    let server_endpoint = DatagramEndpoint::new(server_socket.clone());

    let (client_tx, client_events) = mpsc::channel(64);
    let (server_tx, server_events) = mpsc::channel(64);

    let client = client_endpoint
        .open_channel(
            Arc::new(DatagramCryptor::new(session, &key, PeerRole::Client)),
            DatagramChannelConfig {
                remote: Some(server_addr),
                ..DatagramChannelConfig::default()
            },
            client_tx,
        )
        .unwrap();
    let server = server_endpoint
        .open_channel(
            Arc::new(DatagramCryptor::new(session, &key, PeerRole::Server)),
            DatagramChannelConfig::default(),
            server_tx,
        )
        .unwrap();

    Setup {
        client_socket,
        server_socket,
        client_endpoint,
        server_endpoint,
        client,
        client_events,
        server,
        server_events,
    }
}

async fn next_kind(events: &mut EventReceiver) -> ChannelEventKind {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("event queue closed")
        .kind
}

async fn next_packet(events: &mut EventReceiver) -> Vec<u8> {
    match next_kind(events).await {
        ChannelEventKind::Packet(packet) => packet,
        other => panic!("expected packet, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_learns_remote_from_first_datagram() {
    let mut s = setup();

    assert!(matches!(
        s.server.send_packet(&[0x45, 1, 2, 3]).await,
        Err(Error::NoRemoteEndpoint)
    ));

    s.client.send_packet(&[0x45, 0xAA]).await.unwrap();
    assert_eq!(next_packet(&mut s.server_events).await, vec![0x45, 0xAA]);
    assert_eq!(s.server.remote(), Some(CLIENT_ADDR.parse().unwrap()));

    s.server.send_packet(&[0x45, 0xBB]).await.unwrap();
    assert_eq!(next_packet(&mut s.client_events).await, vec![0x45, 0xBB]);
}

#[tokio::test]
async fn test_forged_and_replayed_datagrams_are_dropped() {
    let mut s = setup();
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();

    s.client.send_packet(&[0x45, 1]).await.unwrap();
    assert_eq!(next_packet(&mut s.server_events).await, vec![0x45, 1]);

    // replay the datagram the client just sent
    let (sealed, _) = s.client_socket.sent().remove(0);
    s.server_socket.inject(sealed.clone(), client_addr);

    // forged: right session id, garbage ciphertext
    let mut forged = sealed[..16].to_vec();
    forged[15] = 0x7F;
    forged.extend_from_slice(&[0u8; 40]);
    s.server_socket.inject(forged, "203.0.113.9:1".parse().unwrap());

    s.client.send_packet(&[0x45, 2]).await.unwrap();
    assert_eq!(next_packet(&mut s.server_events).await, vec![0x45, 2]);

    assert_eq!(s.server.dropped_count(), 2);
    assert!(PacketChannel::from(s.server.clone()).is_open());
    // the forged source was not learned
    assert_eq!(s.server.remote(), Some(client_addr));
}

#[tokio::test]
async fn test_remote_follows_address_change() {
    let mut s = setup();
    let moved: SocketAddr = "192.0.2.77:41000".parse().unwrap();

    s.client.send_packet(&[0x45, 1]).await.unwrap();
    next_packet(&mut s.server_events).await;

    s.client_socket.rebind(moved);
    s.client.send_packet(&[0x45, 2]).await.unwrap();
    next_packet(&mut s.server_events).await;
    assert_eq!(s.server.remote(), Some(moved));

    s.server.send_packet(&[0x45, 3]).await.unwrap();
    let (_, destination) = s.server_socket.sent().pop().unwrap();
    assert_eq!(destination, moved);
}

#[tokio::test]
async fn test_close_notifies_peer() {
    let mut s = setup();
    s.client.send_packet(&[0x45, 1]).await.unwrap();
    next_packet(&mut s.server_events).await;

    PacketChannel::from(s.client.clone()).close(true).await;

    assert!(matches!(
        next_kind(&mut s.client_events).await,
        ChannelEventKind::Closed(CloseReason::Local)
    ));
    assert!(matches!(
        next_kind(&mut s.server_events).await,
        ChannelEventKind::Closed(CloseReason::Remote)
    ));
    assert_eq!(s.client_endpoint.session_count(), 0);
    // give the server's receive task a moment to detach
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(s.server_endpoint.session_count(), 0);
}

#[tokio::test]
async fn test_one_channel_per_session_per_endpoint() {
    let s = setup();
    let (tx, _rx) = mpsc::channel(8);
    let key = SessionKey::from_secret(b"datagram-channel-test");

    let result = s.server_endpoint.open_channel(
        Arc::new(DatagramCryptor::new(SessionId::new(0x5EED), &key, PeerRole::Server)),
        DatagramChannelConfig::default(),
        tx,
    );
    assert!(matches!(result, Err(Error::SessionInUse(_))));
}

#[tokio::test]
async fn test_unknown_sessions_are_counted() {
    let s = setup();
    s.server_socket
        .inject(vec![0u8; 64], "203.0.113.5:9999".parse().unwrap());
    s.server_socket.inject(vec![1, 2, 3], "203.0.113.5:9999".parse().unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.server_endpoint.unrouted_count(), 2);
}

#[tokio::test]
async fn test_endpoint_close_fails_channels() {
    let mut s = setup();
    s.server_endpoint.close();

    match next_kind(&mut s.server_events).await {
        ChannelEventKind::Closed(reason) => assert!(reason.is_unexpected()),
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sessions_share_one_endpoint() {
    let server_endpoint = DatagramEndpoint::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let server_addr = server_endpoint.local_addr().unwrap();

    let mut peers = Vec::new();
    for (id, secret) in [(0xA11CE, &b"session-a"[..]), (0xB0B, &b"session-b"[..])] {
        let session = SessionId::new(id);
        let key = SessionKey::from_secret(secret);
        let (server_tx, server_events) = mpsc::channel(64);
        let (client_tx, client_events) = mpsc::channel(64);

        let server = server_endpoint
            .open_channel(
                Arc::new(DatagramCryptor::new(session, &key, PeerRole::Server)),
                DatagramChannelConfig::default(),
                server_tx,
            )
            .unwrap();

        let client_endpoint = DatagramEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = client_endpoint
            .open_channel(
                Arc::new(DatagramCryptor::new(session, &key, PeerRole::Client)),
                DatagramChannelConfig {
                    remote: Some(server_addr),
                    ..DatagramChannelConfig::default()
                },
                client_tx,
            )
            .unwrap();

        peers.push((client_endpoint, client, client_events, server, server_events));
    }
    assert_eq!(server_endpoint.session_count(), 2);

    for (i, (_, client, _, _, _)) in peers.iter().enumerate() {
        client.send_packet(&[0x45, i as u8]).await.unwrap();
    }
    for (i, (_, _, _, _, server_events)) in peers.iter_mut().enumerate() {
        assert_eq!(next_packet(server_events).await, vec![0x45, i as u8]);
    }

    // each server channel answers only its own client
    peers[0].3.send_packet(&[0x45, 0xA0]).await.unwrap();
    assert_eq!(next_packet(&mut peers[0].2).await, vec![0x45, 0xA0]);
    assert!(timeout(Duration::from_millis(100), peers[1].2.recv()).await.is_err());

    peers[1].3.send_packet(&[0x45, 0xB0]).await.unwrap();
    assert_eq!(next_packet(&mut peers[1].2).await, vec![0x45, 0xB0]);
    assert!(timeout(Duration::from_millis(100), peers[0].4.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(100), peers[1].4.recv()).await.is_err());

    assert_eq!(server_endpoint.unrouted_count(), 0);
    server_endpoint.close();
}
