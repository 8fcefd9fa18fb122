//! Data proxy integration tests
//!
//! These tests run real proxies on loopback sockets and exercise the
//! Identify handshake, pool fan-out, routing, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use hub_proxy::config::ProxyConfig;
use hub_proxy::directory::{HubData, StaticDirectory};
use hub_proxy::message::{codec, Envelope, Identity, MessageKind};
use hub_proxy::DataProxy;

fn test_config(connect_timeout: u64) -> Arc<ProxyConfig> {
    let mut config = ProxyConfig::default();
    config.data_port = 0;
    config.port_increment = false;
    config.connect_timeout = connect_timeout;
    Arc::new(config)
}

/// Connect to a proxy's data port and identify as a local rank
async fn connect_rank(port: u16, rank: i32) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let request = codec::recv_message(&mut stream).await.unwrap();
    assert_eq!(
        request.decode_identify().unwrap().identity,
        Identity::Request
    );

    let identify = Envelope::identify(Identity::LocalBulkData { rank }, 1).unwrap();
    codec::send_message(&mut stream, &identify).await.unwrap();

    let answer = codec::recv_message(&mut stream).await.unwrap();
    assert!(matches!(
        answer.decode_identify().unwrap().identity,
        Identity::RemoteBulkData { .. }
    ));

    stream
}

async fn two_hubs(
    num_ranks_a: usize,
    num_ranks_b: usize,
) -> (Arc<DataProxy>, Arc<DataProxy>, Arc<StaticDirectory>) {
    let directory = Arc::new(StaticDirectory::new());

    let proxy_a = DataProxy::new(test_config(5), directory.clone()).await.unwrap();
    let proxy_b = DataProxy::new(test_config(5), directory.clone()).await.unwrap();

    directory.add_hub(
        -1,
        HubData {
            address: "127.0.0.1".to_string(),
            data_port: proxy_a.listen_port(),
            num_ranks: num_ranks_a,
        },
    );
    directory.add_hub(
        -2,
        HubData {
            address: "127.0.0.1".to_string(),
            data_port: proxy_b.listen_port(),
            num_ranks: num_ranks_b,
        },
    );

    proxy_a.set_hub_id(-1);
    proxy_b.set_hub_id(-2);

    (proxy_a, proxy_b, directory)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_remote_data_fills_pool() {
    let (proxy_a, proxy_b, _directory) = two_hubs(1, 1).await;

    assert!(proxy_a.connect_remote_data(-2).await.unwrap());
    assert!(proxy_a.router().pool_size(-2) > 0);

    // Any message destined to hub -2 resolves to a pool socket
    let envelope = Envelope::with_payload(MessageKind::SendObject, -1, -2, 0, 0, Bytes::new());
    assert!(proxy_a.get_remote_data_sock(&envelope).is_some());

    // A hub the directory does not know yields false, not an error
    assert!(!proxy_a.connect_remote_data(-7).await.unwrap());

    proxy_a.shutdown().await;
    proxy_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_selection_by_rank_is_stable() {
    let (proxy_a, proxy_b, _directory) = two_hubs(1, 3).await;

    assert!(proxy_a.connect_remote_data(-2).await.unwrap());
    let pool_size = proxy_a.router().pool_size(-2);
    assert_eq!(pool_size, 3, "Pool should match the larger rank count");

    // Ranks r and r + pool_size pick the same socket
    for rank in 0..pool_size as i32 {
        let a = proxy_a.router().remote_data_sock(-2, rank).unwrap();
        let b = proxy_a
            .router()
            .remote_data_sock(-2, rank + pool_size as i32)
            .unwrap();
        assert_eq!(a.peer(), b.peer());
    }

    // Repeated calls are satisfied by the existing pool
    assert!(proxy_a.connect_remote_data(-2).await.unwrap());
    assert_eq!(proxy_a.router().pool_size(-2), 3);

    proxy_a.shutdown().await;
    proxy_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_routing() {
    let (proxy_a, proxy_b, _directory) = two_hubs(1, 1).await;

    let mut rank_a = connect_rank(proxy_a.listen_port(), 0).await;
    let mut rank_b = connect_rank(proxy_b.listen_port(), 0).await;

    assert!(proxy_a.connect_remote_data(-2).await.unwrap());

    // Rank 0 on hub -1 sends an object to rank 0 on hub -2
    let payload = Bytes::from_static(b"the quick brown fox carries bulk data");
    let sent = Envelope::with_payload(MessageKind::SendObject, -1, -2, 0, 0, payload.clone());
    codec::send_message(&mut rank_a, &sent).await.unwrap();

    let received = timeout(Duration::from_secs(5), codec::recv_message(&mut rank_b))
        .await
        .expect("message should arrive")
        .unwrap();
    assert_eq!(received.kind(), MessageKind::SendObject);
    assert_eq!(received.header, sent.header);
    assert_eq!(received.payload, payload);

    // Unrecognized message types are forwarded unchanged
    let opaque = Envelope::with_payload(
        MessageKind::Unknown(0x0900),
        -1,
        -2,
        0,
        0,
        Bytes::from_static(b"fail-open"),
    );
    codec::send_message(&mut rank_a, &opaque).await.unwrap();

    let received = timeout(Duration::from_secs(5), codec::recv_message(&mut rank_b))
        .await
        .expect("unknown-type message should arrive")
        .unwrap();
    assert_eq!(received.kind(), MessageKind::Unknown(0x0900));
    assert_eq!(received.payload, opaque.payload);

    // A routing miss drops the payload without killing the connection
    let missing = Envelope::with_payload(MessageKind::SendObject, -1, -2, 0, 9, Bytes::new());
    codec::send_message(&mut rank_a, &missing).await.unwrap();

    let after_miss = Envelope::with_payload(MessageKind::RequestObject, -1, -2, 0, 0, Bytes::new());
    codec::send_message(&mut rank_a, &after_miss).await.unwrap();
    let received = timeout(Duration::from_secs(5), codec::recv_message(&mut rank_b))
        .await
        .expect("later messages should still arrive")
        .unwrap();
    assert_eq!(received.kind(), MessageKind::RequestObject);

    proxy_a.shutdown().await;
    proxy_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_identify_answered_in_place() {
    let (proxy_a, proxy_b, _directory) = two_hubs(1, 1).await;

    let mut rank_a = connect_rank(proxy_a.listen_port(), 0).await;

    let probe = Envelope::identify(Identity::Request, 1).unwrap();
    codec::send_message(&mut rank_a, &probe).await.unwrap();

    let answer = timeout(Duration::from_secs(5), codec::recv_message(&mut rank_a))
        .await
        .expect("identify should be answered")
        .unwrap();
    assert_eq!(
        answer.decode_identify().unwrap().identity,
        Identity::RemoteBulkData { hub_id: -1 }
    );

    proxy_a.shutdown().await;
    proxy_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_connection_is_dropped() {
    let directory = Arc::new(StaticDirectory::new());
    let proxy = DataProxy::new(test_config(1), directory).await.unwrap();
    proxy.set_hub_id(-1);

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.listen_port()))
        .await
        .unwrap();

    // The proxy speaks first; stay silent afterwards
    let request = codec::recv_message(&mut stream).await.unwrap();
    assert_eq!(
        request.decode_identify().unwrap().identity,
        Identity::Request
    );

    // Within a few seconds the proxy gives up on us
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection should be closed, not parked")
        .unwrap();
    assert_eq!(n, 0, "Expected EOF from the proxy");

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_is_complete_and_idempotent() {
    let (proxy_a, proxy_b, _directory) = two_hubs(1, 1).await;
    let port_a = proxy_a.listen_port();

    let mut rank_b = connect_rank(proxy_b.listen_port(), 0).await;
    assert!(proxy_a.connect_remote_data(-2).await.unwrap());

    proxy_a.shutdown().await;
    // Second call is a no-op
    proxy_a.shutdown().await;

    // The listener is gone
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", port_a)).await.is_err(),
        "Data port should refuse connections after shutdown"
    );

    // All tables were cleared
    assert_eq!(proxy_a.router().pool_size(-2), 0);
    assert_eq!(proxy_a.router().local_count(), 0);

    proxy_b.shutdown().await;

    // Registered peers observe the teardown
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), rank_b.read(&mut buf))
        .await
        .expect("peer should see the proxy go away")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
