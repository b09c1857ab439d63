use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use hop_channel::transport::mock::{MockConnector, MockDatagramSocket};
use hop_channel::{
    ChannelEventKind, ConnectionPool, DatagramChannelConfig, DatagramCryptor, DatagramEndpoint,
    PeerRole, PoolConfig, SessionId, SessionKey, TransportKind,
};
use hop_nat::packet::build_udp_packet;
use hop_tunnel::{
    ChannelSettings, DatagramRoute, Error, PooledChannelFactory, SessionParams, Tunnel,
    TunnelConfig, TunnelEvent, TunnelEventHandler,
};

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<TunnelEvent>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<TunnelEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelEventHandler for RecordingHandler {
    async fn on_event(&self, event: TunnelEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn session(peer_max_channel_count: usize) -> SessionParams {
    SessionParams {
        session_id: SessionId::new(0x42),
        peer_max_channel_count,
    }
}

fn echo_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        Arc::new(MockConnector::echo()),
        PoolConfig::default(),
    ))
}

fn udp_packet(payload: &[u8]) -> Vec<u8> {
    let source: SocketAddr = "10.0.0.2:40000".parse().unwrap();
    let destination: SocketAddr = "10.0.0.1:53".parse().unwrap();
    build_udp_packet(source, destination, payload).unwrap()
}

/// Count inbound packets in the background
fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    count
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_echo_round_trip() {
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(echo_pool());
    let (tunnel, mut rx) = Tunnel::new(session(4), TunnelConfig::default(), Arc::new(factory));

    let packet = udp_packet(b"ping");
    tunnel.send_packet(&packet).await.unwrap();

    let echoed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed, packet);
    assert_eq!(tunnel.channel_count(), 1);

    let batch = vec![udp_packet(b"a"), udp_packet(b"bb"), udp_packet(b"ccc")];
    tunnel.send_packets(&batch).await.unwrap();
    for expected in &batch {
        let echoed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(&echoed, expected);
    }

    let stats = tunnel.stats();
    assert_eq!(stats.packets_tx, 4);
    assert_eq!(stats.packets_rx, 4);
    tunnel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_settles_at_peer_cap() {
    let pool = echo_pool();
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(pool.clone());
    let config = TunnelConfig {
        max_channel_count: 6,
        min_spawn_interval: Duration::from_millis(10),
        max_spawn_interval: Duration::from_millis(30),
        maintenance_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (tunnel, rx) = Tunnel::new(session(3), config, Arc::new(factory));
    assert_eq!(tunnel.max_channel_count(), 3);
    let received = drain(rx);

    let packet = udp_packet(b"sustained");
    let mut peak = 0;
    for _ in 0..200 {
        tunnel.send_packet(&packet).await.unwrap();
        peak = peak.max(tunnel.channel_count());
        sleep(Duration::from_millis(5)).await;
    }

    assert!(peak <= 3, "peak channel count {}", peak);
    assert_eq!(tunnel.channel_count(), 3);
    assert_eq!(pool.created_connection_count(), 3);
    assert!(wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst) == 200).await);

    tunnel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_growth_is_gradual() {
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(echo_pool());
    let config = TunnelConfig {
        max_channel_count: 8,
        min_spawn_interval: Duration::from_millis(500),
        max_spawn_interval: Duration::from_secs(1),
        ..Default::default()
    };
    let (tunnel, rx) = Tunnel::new(session(8), config, Arc::new(factory));
    let _received = drain(rx);

    let packet = udp_packet(b"burst");
    for _ in 0..100 {
        tunnel.send_packet(&packet).await.unwrap();
    }

    // a burst opens the first channel and at most one more
    assert!(tunnel.channel_count() <= 2, "{} channels", tunnel.channel_count());
    tunnel.close().await;
}

#[tokio::test]
async fn test_idle_channels_close() {
    let pool = echo_pool();
    let settings = ChannelSettings {
        stream_lifespan: Some(Duration::from_millis(1000)),
        ..Default::default()
    };
    let factory = PooledChannelFactory::new(settings).with_pool(pool.clone());
    let config = TunnelConfig {
        min_channel_count: 0,
        min_spawn_interval: Duration::from_millis(10),
        max_spawn_interval: Duration::from_millis(50),
        maintenance_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let (tunnel, rx) = Tunnel::new(session(4), config, Arc::new(factory));
    let _received = drain(rx);

    let packet = udp_packet(b"short burst");
    for _ in 0..20 {
        tunnel.send_packet(&packet).await.unwrap();
        sleep(Duration::from_millis(10)).await;
    }
    assert!(tunnel.channel_count() >= 1);

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(tunnel.channel_count(), 0);

    assert!(wait_until(Duration::from_secs(2), || {
        let stats = tunnel.stats();
        stats.channels_closed == stats.channels_opened
    })
    .await);
    assert!(tunnel.channels().is_empty());
    assert!(pool.free_connection_count() >= 1);
    assert_eq!(tunnel.stats().channels_failed, 0);
    tunnel.close().await;
}

#[tokio::test]
async fn test_minimum_channel_kept_without_traffic() {
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(echo_pool());
    let config = TunnelConfig {
        min_channel_count: 1,
        maintenance_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (tunnel, _rx) = Tunnel::new(session(4), config, Arc::new(factory));

    assert!(wait_until(Duration::from_secs(2), || tunnel.channel_count() == 1).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(tunnel.channel_count(), 1);
    tunnel.close().await;
}

#[tokio::test]
async fn test_lost_channel_is_replaced() {
    let (connector, mut accepted) = MockConnector::new();
    let connector = Arc::new(connector);
    let pool = Arc::new(ConnectionPool::new(connector.clone(), PoolConfig::default()));
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(pool);
    let handler = Arc::new(RecordingHandler::default());
    let config = TunnelConfig {
        min_channel_count: 1,
        min_spawn_interval: Duration::from_millis(10),
        maintenance_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (tunnel, _rx) = Tunnel::with_handler(session(4), config, Arc::new(factory), handler.clone());

    // the peer vanishes without finishing the exchange
    let first = timeout(Duration::from_secs(2), accepted.recv()).await.unwrap().unwrap();
    drop(first);

    let second = timeout(Duration::from_secs(2), accepted.recv()).await.unwrap().unwrap();
    assert!(wait_until(Duration::from_secs(2), || connector.connect_count() == 2).await);
    assert!(wait_until(Duration::from_secs(2), || tunnel.channel_count() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || tunnel.stats().channels_failed == 1).await);

    let lost = handler.events().into_iter().any(|event| {
        matches!(event, TunnelEvent::ChannelClosed { unexpected: true, .. })
    });
    assert!(lost);

    drop(second);
    tunnel.close().await;
}

#[tokio::test]
async fn test_switch_protocol_retires_old_channels() {
    let session_id = SessionId::new(0x42);
    let key = SessionKey::random();
    let client_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:4096".parse().unwrap();
    let (client_socket, server_socket) = MockDatagramSocket::pair(client_addr, server_addr);

    // server side: echo every packet on the session's datagram channel
    let server_endpoint = DatagramEndpoint::new(server_socket);
    let server_cryptor = Arc::new(DatagramCryptor::new(session_id, &key, PeerRole::Server));
    let (server_events, mut server_rx) = mpsc::channel(64);
    let server_channel = server_endpoint
        .open_channel(server_cryptor, DatagramChannelConfig::default(), server_events)
        .unwrap();
    tokio::spawn(async move {
        while let Some(event) = server_rx.recv().await {
            if let ChannelEventKind::Packet(packet) = event.kind {
                let _ = server_channel.send_packet(&packet).await;
            }
        }
    });

    let route = DatagramRoute {
        endpoint: DatagramEndpoint::new(client_socket),
        cryptor: Arc::new(DatagramCryptor::new(session_id, &key, PeerRole::Client)),
        remote: Some(server_addr),
    };
    let factory = PooledChannelFactory::new(ChannelSettings::default())
        .with_pool(echo_pool())
        .with_datagram(route);
    let handler = Arc::new(RecordingHandler::default());
    let config = TunnelConfig {
        min_channel_count: 1,
        max_spawn_interval: Duration::from_secs(10),
        maintenance_interval: Duration::from_millis(50),
        retire_idle: Duration::from_millis(200),
        ..Default::default()
    };
    let (tunnel, mut rx) = Tunnel::with_handler(session(4), config, Arc::new(factory), handler.clone());

    for i in 0..5u8 {
        let packet = udp_packet(&[i]);
        tunnel.send_packet(&packet).await.unwrap();
        let echoed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, packet);
    }
    assert!(tunnel.channel_count_of(TransportKind::Stream) >= 1);

    let old = tunnel.set_active_protocol(TransportKind::Datagram).await;
    assert_eq!(old, TransportKind::Stream);

    for i in 0..5u8 {
        let packet = udp_packet(&[0x80 | i]);
        tunnel.send_packet(&packet).await.unwrap();
        let echoed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, packet);
    }
    assert_eq!(tunnel.channel_count_of(TransportKind::Datagram), 1);
    assert_eq!(tunnel.session_id(), session_id);

    assert!(wait_until(Duration::from_secs(3), || {
        tunnel.channel_count_of(TransportKind::Stream) == 0
    })
    .await);
    assert_eq!(tunnel.channel_count(), 1);

    let events = handler.events();
    assert!(events.iter().any(|event| matches!(
        event,
        TunnelEvent::ProtocolChanged {
            old: TransportKind::Stream,
            new: TransportKind::Datagram,
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        TunnelEvent::ChannelOpened {
            kind: TransportKind::Datagram,
            ..
        }
    )));

    tunnel.close().await;
    // the peer drops its session once the close notice arrives
    assert!(wait_until(Duration::from_secs(2), || server_endpoint.session_count() == 0).await);
}

#[tokio::test]
async fn test_close_releases_everything() {
    let pool = echo_pool();
    let factory = PooledChannelFactory::new(ChannelSettings::default()).with_pool(pool.clone());
    let handler = Arc::new(RecordingHandler::default());
    let config = TunnelConfig {
        min_spawn_interval: Duration::from_millis(10),
        max_spawn_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (tunnel, mut rx) = Tunnel::with_handler(session(4), config, Arc::new(factory), handler.clone());

    let packet = udp_packet(b"x");
    for _ in 0..10 {
        tunnel.send_packet(&packet).await.unwrap();
        sleep(Duration::from_millis(25)).await;
    }
    let opened = tunnel.channel_count();
    assert!(opened >= 2);

    tunnel.close().await;
    assert!(tunnel.is_closed());
    assert_eq!(tunnel.channel_count(), 0);
    assert!(tunnel.channels().is_empty());
    let stats = tunnel.stats();
    assert_eq!(stats.channels_closed, stats.channels_opened);
    assert_eq!(pool.free_connection_count() as u64, stats.channels_opened);
    assert!(matches!(tunnel.send_packet(&packet).await, Err(Error::Closed)));

    // inbound queue ends once the tunnel is closed
    while timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_some() {}

    let events = handler.events();
    assert!(matches!(events.last(), Some(TunnelEvent::Closed { .. })));
    let closed = events
        .iter()
        .filter(|event| matches!(event, TunnelEvent::ChannelClosed { .. }))
        .count();
    assert_eq!(closed as u64, stats.channels_opened);

    // closing twice is harmless
    tunnel.close().await;
}
