use bytes::{Bytes, BytesMut};
use rdma_direct::drivers::rdma::transport::protocol::STATUS_NOT_SUPPORTED;
use rdma_direct::error::{NegotiateError, ProviderError};
use rdma_direct::{
    accept, connect, BufferDescriptor, Connection, ConnectionStatus, Direction, Error, InvalidateMode, LoopbackFabric,
    MrState, Role, TeardownResult, TransportConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

async fn pair_with(
    fabric: &LoopbackFabric,
    port: u16,
    client_config: TransportConfig,
    server_config: TransportConfig,
) -> (Connection, Connection) {
    let listener = fabric.listen(addr(port)).unwrap();
    let server = tokio::spawn(async move { accept(&listener, server_config).await });
    let client = connect(Arc::new(fabric.clone()), addr(port), client_config)
        .await
        .expect("connect failed");
    let server = server.await.unwrap().expect("accept failed");
    (client, server)
}

async fn pair(fabric: &LoopbackFabric, port: u16) -> (Connection, Connection) {
    pair_with(fabric, port, TransportConfig::default(), TransportConfig::default()).await
}

/// Let credit grants triggered by the handshake settle.
async fn quiesce() {
    sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_echo() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5000).await;

    assert_eq!(client.role(), Role::Initiator);
    assert_eq!(server.role(), Role::Responder);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    let params = client.params().unwrap();
    assert_eq!(params.max_send_size, 1364);
    assert_eq!(params.initial_send_credits, 255);

    client.send(Bytes::from_static(b"Hello RDMA")).await?;
    let msg = server.recv(10).await?;
    assert_eq!(msg.as_ref(), b"Hello RDMA");

    server.send(msg).await?;
    let response = client.recv(10).await?;
    assert_eq!(response.as_ref(), b"Hello RDMA");
    Ok(())
}

#[tokio::test]
async fn test_large_message_is_fragmented_transparently() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5001).await;
    quiesce().await;
    let before = client.stats();

    let data: Bytes = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    client.send(data.clone()).await?;
    let got = server.recv(5000).await?;
    assert_eq!(got, data);

    let after = client.stats();
    let payload_packets =
        (after.packets_sent - after.credit_packets_sent) - (before.packets_sent - before.credit_packets_sent);
    assert_eq!(payload_packets, 4);
    assert_eq!(after.bytes_sent - before.bytes_sent, 5000);
    Ok(())
}

#[tokio::test]
async fn test_reads_cross_message_boundaries() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5002).await;

    client
        .send_vectored(&[Bytes::from_static(b"abc"), Bytes::from_static(b"def")])
        .await?;
    client.send(Bytes::from_static(b"ghij")).await?;

    assert_eq!(server.recv(2).await?.as_ref(), b"ab");
    assert_eq!(server.recv(7).await?.as_ref(), b"cdefghi");
    assert_eq!(server.recv(1).await?.as_ref(), b"j");
    Ok(())
}

#[tokio::test]
async fn test_invalid_sends_rejected() {
    let fabric = LoopbackFabric::new();
    let (client, _server) = pair(&fabric, 5003).await;

    assert!(matches!(client.send(Bytes::new()).await, Err(Error::InvalidInput(_))));
    let too_big = Bytes::from(vec![0u8; 1024 * 1024 + 1]);
    assert!(matches!(client.send(too_big).await, Err(Error::InvalidInput(_))));
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_many_messages_keep_credits_balanced() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let config = TransportConfig::default()
        .with_send_credit_target(8)
        .with_receive_credit_max(8);
    let (client, server) = pair_with(&fabric, 5004, config.clone(), config).await;

    let reader = tokio::spawn(async move {
        for i in 0..200u32 {
            let msg = server.recv(4).await?;
            assert_eq!(msg.as_ref(), &i.to_le_bytes());
        }
        Ok::<_, Error>(server)
    });
    for i in 0..200u32 {
        client.send(Bytes::copy_from_slice(&i.to_le_bytes())).await?;
    }
    let server = reader.await.unwrap()?;

    quiesce().await;
    for conn in [&client, &server] {
        let stats = conn.stats();
        assert!(stats.send_credits_consumed <= stats.peer_credits_granted);
        assert!(conn.send_credits() <= 8);
        assert!(conn.receive_credits() <= 8);
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_post_rolls_back_credits() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5005).await;
    quiesce().await;

    let credits = client.send_credits();
    let granted = client.receive_credits();
    fabric.fail_next_post(ProviderError::QueueFull);
    let err = client.send(Bytes::from_static(b"once")).await.unwrap_err();
    assert!(matches!(err, Error::Resource(_)));
    assert!(err.is_retryable());
    assert_eq!(client.send_credits(), credits);
    assert_eq!(client.receive_credits(), granted);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.send(Bytes::from_static(b"once")).await?;
    assert_eq!(server.recv(4).await?.as_ref(), b"once");
    Ok(())
}

#[tokio::test]
async fn test_fatal_post_failure_disconnects() {
    let fabric = LoopbackFabric::new();
    let (client, _server) = pair(&fabric, 5006).await;
    quiesce().await;

    fabric.fail_next_post(ProviderError::Other {
        code: 5,
        message: "io error".into(),
    });
    let err = client.send(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    timeout(Duration::from_secs(1), client.closed()).await.unwrap();
    assert!(matches!(client.send(Bytes::from_static(b"x")).await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_unblocks_reader() {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5007).await;
    let server = Arc::new(server);

    let reader = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.recv(16).await }
    });
    sleep(Duration::from_millis(10)).await;
    assert!(!reader.is_finished());

    client.disconnect();
    let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_rdma_write_into_registered_buffer() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5008).await;

    let handle = server
        .register_memory(BytesMut::zeroed(8192), Direction::FromPeer, InvalidateMode::Local)
        .await?;
    assert_eq!(handle.state(), MrState::Registered);
    assert_eq!(fabric.live_registrations(), 1);
    server.send(handle.descriptor().encode()).await?;

    let desc = BufferDescriptor::decode(&client.recv(16).await?).unwrap();
    assert_eq!(desc.len(), 8192);
    let payload = Bytes::from(vec![0x5au8; 6000]);
    client.rdma_write(&desc, payload.clone()).await?;
    client.send(Bytes::from_static(b"done")).await?;

    assert_eq!(server.recv(4).await?.as_ref(), b"done");
    let buf = handle.deregister().await?;
    assert_eq!(&buf[..6000], &payload[..]);
    assert!(buf[6000..].iter().all(|&b| b == 0));
    assert_eq!(fabric.live_registrations(), 0);

    // The fenced registration cannot be reached any more.
    let err = client.rdma_write(&desc, Bytes::from_static(b"late")).await.unwrap_err();
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn test_remote_invalidate() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5009).await;

    let mut source = BytesMut::with_capacity(5000);
    source.extend((0..5000u32).map(|i| (i % 7) as u8));
    let expected = source.clone();
    let handle = server
        .register_memory(source, Direction::ToPeer, InvalidateMode::Remote)
        .await?;
    let desc = handle.descriptor();

    let read = client.rdma_read(&desc).await?;
    assert_eq!(read, expected.freeze());
    client
        .send_with_invalidate(Bytes::from_static(b"done"), desc.token())
        .await?;

    assert_eq!(server.recv(4).await?.as_ref(), b"done");
    assert_eq!(handle.state(), MrState::Invalidated);
    assert_eq!(fabric.live_registrations(), 0);
    let buf = handle.deregister().await?;
    assert_eq!(buf.len(), 5000);
    Ok(())
}

#[tokio::test]
async fn test_dropped_registration_is_recovered() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (_client, server) = pair(&fabric, 5010).await;

    let handle = server
        .register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local)
        .await?;
    let stale = handle.descriptor();
    drop(handle);

    timeout(Duration::from_secs(1), async {
        while server.stats().mr_recoveries == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("registration never recovered");
    assert_eq!(fabric.live_registrations(), 0);

    let fresh = server
        .register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local)
        .await?;
    assert_ne!(fresh.token(), stale.token());
    fresh.deregister().await?;
    Ok(())
}

#[tokio::test]
async fn test_registration_limits() {
    let fabric = LoopbackFabric::new();
    let config = TransportConfig::default().with_max_frmr_depth(2);
    let (client, _server) = pair_with(&fabric, 5011, config, TransportConfig::default()).await;

    let too_many_pages = client
        .register_memory(BytesMut::zeroed(3 * 4096), Direction::ToPeer, InvalidateMode::Local)
        .await;
    assert!(matches!(too_many_pages, Err(Error::InvalidInput(_))));
    let empty = client
        .register_memory(BytesMut::new(), Direction::ToPeer, InvalidateMode::Local)
        .await;
    assert!(matches!(empty, Err(Error::InvalidInput(_))));
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_version_mismatch_fails_negotiation() {
    let fabric = LoopbackFabric::new();
    let listener = fabric.listen(addr(5012)).unwrap();
    let server = tokio::spawn(async move { accept(&listener, TransportConfig::default()).await });

    let client_config = TransportConfig {
        protocol_version: 0x0300,
        ..TransportConfig::default()
    };
    let err = connect(Arc::new(fabric.clone()), addr(5012), client_config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Negotiation(NegotiateError::Status(STATUS_NOT_SUPPORTED))));

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Negotiation(NegotiateError::Version { .. })));
    assert_eq!(fabric.allocated_mrs(), 0);
}

#[tokio::test]
async fn test_connect_to_nowhere() {
    let fabric = LoopbackFabric::new();
    let err = connect(Arc::new(fabric), addr(5013), TransportConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_keepalive_and_stall() {
    let fabric = LoopbackFabric::new();
    let client_config = TransportConfig::default().with_keepalive_interval(Duration::from_secs(10));
    let server_config = TransportConfig::default().with_keepalive_interval(Duration::from_secs(100));
    let (client, server) = pair_with(&fabric, 5014, client_config, server_config).await;

    sleep(Duration::from_millis(10_500)).await;
    assert_eq!(client.stats().keepalives_sent, 1);
    assert_eq!(server.stats().keepalives_sent, 0);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    // Nothing reaches the peer any more: one more keepalive, then the stall.
    fabric.set_blackhole(true);
    timeout(Duration::from_secs(25), client.closed())
        .await
        .expect("stall not detected");
    assert_eq!(client.stats().keepalives_sent, 2);
}

#[tokio::test]
async fn test_reconnect() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let listener = fabric.listen(addr(5015)).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(conn) = accept(&listener, TransportConfig::default()).await {
            if tx.send(conn).is_err() {
                break;
            }
        }
    });

    let mut client = connect(Arc::new(fabric.clone()), addr(5015), TransportConfig::default()).await?;
    let first = rx.recv().await.unwrap();
    client.send(Bytes::from_static(b"one")).await?;
    assert_eq!(first.recv(3).await?.as_ref(), b"one");

    client.reconnect().await?;
    let mut second = rx.recv().await.unwrap();
    timeout(Duration::from_secs(1), first.closed()).await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.send(Bytes::from_static(b"two")).await?;
    assert_eq!(second.recv(3).await?.as_ref(), b"two");
    assert!(matches!(second.reconnect().await, Err(Error::InvalidInput(_))));
    Ok(())
}

#[tokio::test]
async fn test_destroy_releases_everything() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (client, server) = pair(&fabric, 5016).await;
    client.send(Bytes::from_static(b"left unread")).await?;
    quiesce().await;
    assert!(fabric.allocated_mrs() > 0);

    assert_eq!(server.destroy().await, TeardownResult::Graceful);
    assert_eq!(client.destroy().await, TeardownResult::Graceful);
    assert_eq!(fabric.allocated_mrs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_read_limit_follows_peer_send_size() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let client_config = TransportConfig::default().with_max_send_size(256);
    let (client, server) = pair_with(&fabric, 5017, client_config, TransportConfig::default()).await;
    assert_eq!(server.params().unwrap().peer_max_send_size, 256);

    // 255 queued receives of at most 232 payload bytes each.
    assert!(matches!(server.recv(100_000).await, Err(Error::InvalidInput(_))));
    assert!(matches!(server.recv(59_161).await, Err(Error::InvalidInput(_))));

    let data: Bytes = (0..50_000u32).map(|i| (i % 253) as u8).collect::<Vec<u8>>().into();
    client.send(data.clone()).await?;
    assert_eq!(server.recv(50_000).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_registration_returns_object() {
    let fabric = LoopbackFabric::new();
    let server_config = TransportConfig::default().with_teardown_timeout(Duration::from_millis(500));
    let (_client, server) = pair_with(&fabric, 5018, TransportConfig::default(), server_config).await;
    quiesce().await;

    // The registration is posted but its completion has not arrived yet.
    tokio::select! {
        biased;
        _ = server.register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local) => {}
        _ = std::future::ready(()) => {}
    }
    timeout(Duration::from_secs(1), async {
        while server.stats().mr_recoveries == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("abandoned registration object never recovered");
    assert_eq!(fabric.live_registrations(), 0);

    assert_eq!(server.destroy().await, TeardownResult::Graceful);
}

#[tokio::test]
async fn test_failed_registration_is_rebuilt() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let (_client, server) = pair(&fabric, 5019).await;
    quiesce().await;
    let allocated = fabric.allocated_mrs();

    fabric.fail_next_post(ProviderError::QueueFull);
    let err = server
        .register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    timeout(Duration::from_secs(1), async {
        while server.stats().mr_recoveries == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("failed registration object never rebuilt");
    assert_eq!(fabric.allocated_mrs(), allocated);
    assert_eq!(server.status(), ConnectionStatus::Connected);

    let handle = server
        .register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local)
        .await?;
    assert_eq!(handle.state(), MrState::Registered);
    handle.deregister().await?;
    Ok(())
}

#[tokio::test]
async fn test_registration_waits_for_free_object() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let server_config = TransportConfig::default().with_responder_resources(1);
    let (_client, server) = pair_with(&fabric, 5020, TransportConfig::default(), server_config).await;
    let server = Arc::new(server);

    let register = |server: Arc<Connection>| async move {
        server
            .register_memory(BytesMut::zeroed(4096), Direction::FromPeer, InvalidateMode::Local)
            .await
    };
    let first = register(Arc::clone(&server)).await?;
    let second = register(Arc::clone(&server)).await?;
    let first_token = first.token();

    let waiter = tokio::spawn(register(Arc::clone(&server)));
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    first.deregister().await?;
    let third = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap()?;
    assert_eq!(third.token(), first_token);

    let stuck = tokio::spawn(register(Arc::clone(&server)));
    sleep(Duration::from_millis(20)).await;
    assert!(!stuck.is_finished());

    server.disconnect();
    let result = timeout(Duration::from_secs(1), stuck).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::NotConnected)));
    drop((second, third));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_unblocks_sender_waiting_for_credits() {
    let fabric = LoopbackFabric::new();
    let client_config = TransportConfig::default().with_send_credit_target(4);
    let server_config = TransportConfig::default().with_receive_credit_max(4);
    let (client, _server) = pair_with(&fabric, 5021, client_config, server_config).await;
    let client = Arc::new(client);

    // The server never reads, so its four receive buffers fill up.
    let sender = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            for i in 0..64u32 {
                client.send(Bytes::copy_from_slice(&i.to_le_bytes())).await?;
            }
            Ok::<_, Error>(())
        }
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!sender.is_finished());
    assert_eq!(client.send_credits(), 0);

    client.disconnect();
    let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_waits_for_credits() -> rdma_direct::Result<()> {
    let fabric = LoopbackFabric::new();
    let client_config = TransportConfig::default()
        .with_send_credit_target(4)
        .with_keepalive_interval(Duration::from_secs(10));
    let server_config = TransportConfig::default()
        .with_receive_credit_max(4)
        .with_keepalive_interval(Duration::from_secs(100));
    let (client, server) = pair_with(&fabric, 5022, client_config, server_config).await;

    for i in 0..4u32 {
        client.send(Bytes::copy_from_slice(&i.to_le_bytes())).await?;
    }
    // Several intervals pass with the idle keepalive parked on a credit.
    sleep(Duration::from_secs(35)).await;
    assert_eq!(client.send_credits(), 0);
    assert_eq!(client.stats().keepalives_sent, 0);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    assert_eq!(server.recv(16).await?.len(), 16);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.stats().keepalives_sent, 1);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    Ok(())
}
