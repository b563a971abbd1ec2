
use std::net::SocketAddr;
use std::time::Duration;

use harness::{
    free_port, free_udp_port, service_config, udp_service_config, TcpEchoTarget,
    UdpRecordingTarget, WakeSink, TEST_MAC,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use wolp_proxy::{LivenessStatus, ServiceProxy, ShutdownPolicy, WakeOutcome};

/// Send `payload` through the proxy and read the echo.
async fn echo_through(proxy: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Wait for the proxy to close the connection without sending anything.
async fn wait_closed(stream: &mut TcpStream) -> usize {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf).await {
        Ok(n) => n,
        // A reset also counts as closed.
        Err(_) => 0,
    }
}

#[tokio::test]
async fn concurrent_clients_share_one_episode() {
    let sink = WakeSink::spawn().await.unwrap();
    let target_port = free_port().await;
    let config = service_config(
        target_port,
        free_port().await,
        &sink,
        Duration::from_secs(5),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr();

    let mut clients = Vec::new();
    for i in 0..5u8 {
        clients.push(tokio::spawn(async move {
            echo_through(proxy_addr, &[b'c', i]).await
        }));
    }

    // Target comes up mid-episode.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(proxy.coordinator().is_waking());
    let woke_at = Instant::now();
    let _target = TcpEchoTarget::spawn_at(target_port).await.unwrap();

    for (i, client) in clients.into_iter().enumerate() {
        let echoed = timeout(Duration::from_secs(3), client)
            .await
            .expect("client should be released")
            .unwrap()
            .unwrap();
        assert_eq!(echoed, vec![b'c', i as u8]);
    }

    // Released within about one polling interval of the target answering.
    assert!(woke_at.elapsed() < Duration::from_millis(1000));

    assert_eq!(sink.wait_for(1, Duration::from_millis(200)).await, 1);
    assert_eq!(sink.macs()[0].to_string(), TEST_MAC);

    let stats = proxy.stats();
    assert_eq!(stats.wake_episodes, 1);
    assert_eq!(stats.wake_packets_sent, 1);
    assert!(!proxy.coordinator().is_waking());

    proxy.stop().await;
}

#[tokio::test]
async fn wake_timeout_closes_client_after_deadline() {
    let sink = WakeSink::spawn().await.unwrap();
    let config = service_config(
        free_port().await,
        free_port().await,
        &sink,
        Duration::from_secs(2),
        Duration::from_secs(1),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let n = timeout(Duration::from_secs(5), wait_closed(&mut client))
        .await
        .expect("client should be closed after the wake timeout");
    let elapsed = started.elapsed();

    assert_eq!(n, 0, "no byte may be forwarded on a wake timeout");
    assert!(elapsed >= Duration::from_secs(2), "closed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "closed late: {:?}", elapsed);

    assert_eq!(sink.wait_for(1, Duration::from_millis(200)).await, 1);
    let stats = proxy.stats();
    assert_eq!(stats.wake_timeouts, 1);
    assert_eq!(stats.connections_rejected, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn timeout_is_never_reported_early() {
    let sink = WakeSink::spawn().await.unwrap();
    let wake_timeout = Duration::from_millis(500);
    let config = service_config(
        free_port().await,
        free_port().await,
        &sink,
        wake_timeout,
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    for _ in 0..3 {
        let started = Instant::now();
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        timeout(Duration::from_secs(2), wait_closed(&mut client))
            .await
            .unwrap();
        assert!(started.elapsed() >= wake_timeout);
    }

    proxy.stop().await;
}

#[tokio::test]
async fn each_episode_sends_its_own_packet() {
    let sink = WakeSink::spawn().await.unwrap();
    let config = service_config(
        free_port().await,
        free_port().await,
        &sink,
        Duration::from_millis(300),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    for expected in 1..=2 {
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        timeout(Duration::from_secs(2), wait_closed(&mut client))
            .await
            .unwrap();
        assert_eq!(
            sink.wait_for(expected, Duration::from_millis(200)).await,
            expected
        );
    }

    let stats = proxy.stats();
    assert_eq!(stats.wake_episodes, 2);
    assert_eq!(stats.wake_packets_sent, 2);

    proxy.stop().await;
}

#[tokio::test]
async fn reachable_target_skips_wake() {
    let sink = WakeSink::spawn().await.unwrap();
    let target = TcpEchoTarget::spawn().await.unwrap();
    let config = service_config(
        target.addr.port(),
        free_port().await,
        &sink,
        Duration::from_secs(2),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    let echoed = echo_through(proxy.local_addr(), b"hello").await.unwrap();
    assert_eq!(echoed, b"hello");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(), 0);
    assert_eq!(proxy.stats().wake_packets_sent, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn stop_releases_parked_clients() {
    let sink = WakeSink::spawn().await.unwrap();
    let config = service_config(
        free_port().await,
        free_port().await,
        &sink,
        Duration::from_secs(30),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(proxy.coordinator().is_waking());

    let started = Instant::now();
    proxy.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let n = timeout(Duration::from_secs(1), wait_closed(&mut client))
        .await
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn stopped_service_never_wakes() {
    let sink = WakeSink::spawn().await.unwrap();
    let config = service_config(
        free_port().await,
        free_port().await,
        &sink,
        Duration::from_secs(2),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();
    proxy.stop().await;

    assert_eq!(proxy.coordinator().ensure_awake().await, WakeOutcome::TimedOut);
    assert!(!proxy.coordinator().is_waking());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(), 0);
    assert_eq!(proxy.stats().wake_episodes, 0);
}

#[tokio::test]
async fn datagrams_parked_during_wake_keep_their_order() {
    let sink = WakeSink::spawn().await.unwrap();
    let target_port = free_udp_port().await;
    let config = udp_service_config(
        target_port,
        free_udp_port().await,
        &sink,
        Duration::from_secs(5),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    // Loopback answers the empty check datagram with a port-unreachable error.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        proxy.monitor().current_state().status,
        LivenessStatus::Unreachable
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(proxy.local_addr()).await.unwrap();
    for i in 0..8u8 {
        client.send(&[i]).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(proxy.coordinator().is_waking());
    let target = UdpRecordingTarget::spawn_at(target_port).await.unwrap();

    let expected: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i]).collect();
    assert_eq!(target.wait_for(8, Duration::from_secs(3)).await, expected);

    // Once awake, later datagrams follow the parked ones.
    for i in 8..12u8 {
        client.send(&[i]).await.unwrap();
    }
    let expected: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i]).collect();
    assert_eq!(target.wait_for(12, Duration::from_secs(2)).await, expected);

    assert_eq!(sink.wait_for(1, Duration::from_millis(200)).await, 1);
    let stats = proxy.stats();
    assert_eq!(stats.wake_episodes, 1);
    assert_eq!(stats.wake_packets_sent, 1);
    assert_eq!(stats.datagrams_to_target, 12);

    proxy.stop().await;
}

#[tokio::test]
async fn datagrams_rejected_on_wake_timeout() {
    let sink = WakeSink::spawn().await.unwrap();
    let config = udp_service_config(
        free_udp_port().await,
        free_udp_port().await,
        &sink,
        Duration::from_millis(500),
        Duration::from_millis(100),
    );
    let proxy = ServiceProxy::start(config, ShutdownPolicy::default())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(proxy.local_addr()).await.unwrap();
    client.send(b"one").await.unwrap();
    client.send(b"two").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let stats = proxy.stats();
    assert_eq!(stats.connections_rejected, 2);
    assert_eq!(stats.datagrams_to_target, 0);
    assert_eq!(stats.wake_episodes, 1);
    assert_eq!(stats.wake_timeouts, 1);
    assert_eq!(sink.count(), 1);
    assert!(!proxy.coordinator().is_waking());

    proxy.stop().await;
}
