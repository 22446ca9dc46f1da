//! Integration tests for local port forwarding

mod common;

use common::{closed_port, port_open, start_echo_server, wait_until, LOCALHOST};
use rustforward::config::ForwardingConfig;
use rustforward::{event_loop, ForwardError, ForwardingListener};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_test::{assert_err, assert_ok};

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(received, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwards_to_echo_server() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();

    assert_ne!(listener.listening_port(), 0);
    assert_eq!(listener.remote_addr().port(), echo_port);
    assert!(event_loop::is_running());

    let mut client = connect(listener.listening_port()).await;
    echo_round_trip(&mut client, b"hello through the forwarder").await;

    assert_ok!(listener.shutdown());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_payload_with_small_chunks() {
    let echo_port = start_echo_server().await;
    let config = ForwardingConfig {
        remote_host: "127.0.0.1".to_string(),
        remote_port: echo_port,
        chunk_size: 7,
        ..ForwardingConfig::default()
    };
    let listener = ForwardingListener::start(&config).unwrap();

    let payload: Arc<Vec<u8>> = Arc::new((0..256 * 1024).map(|i| (i % 253) as u8).collect());
    let client = connect(listener.listening_port()).await;
    let (mut reader, mut writer) = client.into_split();

    let to_send = Arc::clone(&payload);
    let writer_task = tokio::spawn(async move {
        writer.write_all(&to_send).await.unwrap();
        writer
    });

    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(30), reader.read_exact(&mut received))
        .await
        .expect("payload did not come back in time")
        .unwrap();
    assert!(received == *payload, "relayed bytes differ from what was sent");

    let _writer = writer_task.await.unwrap();
    let stats = listener.stats();
    assert_eq!(stats.bytes_upstream, payload.len() as u64);
    assert_eq!(stats.bytes_downstream, payload.len() as u64);

    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_each_accept_opens_one_remote_connection() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    let port = listener.listening_port();

    let mut clients = Vec::new();
    for i in 0..5u8 {
        let mut client = connect(port).await;
        echo_round_trip(&mut client, &[i; 32]).await;
        clients.push(client);
    }

    let stats = listener.stats();
    assert_eq!(stats.accepted, 5);
    assert_eq!(stats.remote_connects, 5);
    assert_eq!(stats.active_pairs, 5);

    drop(clients);
    let all_closed = wait_until(Duration::from_secs(5), || async {
        listener.stats().closed_pairs == 5
    })
    .await;
    assert!(all_closed, "pairs still open: {:?}", listener.stats());
    assert_eq!(listener.stats().active_pairs, 0);

    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interleaved_traffic_in_both_directions() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();

    let mut first = connect(listener.listening_port()).await;
    let mut second = connect(listener.listening_port()).await;

    for round in 0..20u32 {
        echo_round_trip(&mut first, format!("first-{}", round).as_bytes()).await;
        echo_round_trip(&mut second, format!("second-{}", round).as_bytes()).await;
    }

    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_remote_closes_client() {
    let dead_port = closed_port();
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", dead_port).unwrap();

    let mut client = connect(listener.listening_port()).await;
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    let counted = wait_until(Duration::from_secs(5), || async {
        listener.stats().failed_connects == 1
    })
    .await;
    assert!(counted, "stats: {:?}", listener.stats());

    // The listener itself keeps running
    assert!(listener.is_listening().unwrap());
    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preferred_port_is_used_when_free() {
    let echo_port = start_echo_server().await;
    let preferred = closed_port();
    let config = ForwardingConfig {
        remote_host: "127.0.0.1".to_string(),
        remote_port: echo_port,
        preferred_port: Some(preferred),
        ..ForwardingConfig::default()
    };

    let listener = ForwardingListener::start(&config).unwrap();
    assert_eq!(listener.listening_port(), preferred);
    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_taken_preferred_port_falls_back() {
    let echo_port = start_echo_server().await;
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let config = ForwardingConfig {
        remote_host: "127.0.0.1".to_string(),
        remote_port: echo_port,
        preferred_port: Some(taken),
        ..ForwardingConfig::default()
    };
    let listener = ForwardingListener::start(&config).unwrap();

    assert_ne!(listener.listening_port(), taken);
    assert_ne!(listener.listening_port(), 0);
    listener.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_keeps_established_sessions() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    let port = listener.listening_port();

    let mut client = connect(port).await;
    echo_round_trip(&mut client, b"before shutdown").await;

    assert!(listener.shutdown().unwrap());
    assert!(!listener.shutdown().unwrap());
    assert!(!listener.is_listening().unwrap());

    assert_err!(TcpStream::connect(("127.0.0.1", port)).await);
    echo_round_trip(&mut client, b"after shutdown").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropping_listener_keeps_forwarding() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    let handle = listener.handle();
    let port = listener.listening_port();
    drop(listener);

    assert!(port_open(port).await);
    let mut client = connect(port).await;
    echo_round_trip(&mut client, b"still here").await;

    assert!(handle.shutdown().unwrap());
    assert!(!port_open(port).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_starts_share_one_loop() {
    let echo_port = start_echo_server().await;

    let threads: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(move || {
                ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap()
            })
        })
        .collect();
    let listeners: Vec<ForwardingListener> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();

    let generation = listeners[0].generation();
    assert!(listeners.iter().all(|l| l.generation() == generation));
    assert_eq!(event_loop::current_generation(), Some(generation));

    for listener in &listeners {
        let mut client = connect(listener.listening_port()).await;
        echo_round_trip(&mut client, b"shared loop").await;
    }

    for listener in &listeners {
        listener.shutdown().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_and_shutdown_from_blocking_thread() {
    let echo_port = start_echo_server().await;
    let listener = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    let handle = listener.handle();

    let nested = listener.handle();
    let closed = tokio::task::spawn_blocking(move || {
        let other = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
        let other_handle = other.handle();
        (nested.shutdown().unwrap(), other_handle.shutdown().unwrap())
    })
    .await
    .unwrap();

    assert_eq!(closed, (true, true));
    assert!(!handle.is_listening().unwrap());
}

#[test]
fn test_unbindable_address_is_a_bind_error() {
    // TEST-NET-1 is never assigned to a local interface
    let err = ForwardingListener::bind("192.0.2.1".parse().unwrap(), "127.0.0.1", 80).unwrap_err();
    assert!(matches!(err, ForwardError::Bind { .. }), "got {:?}", err);
}

#[test]
fn test_unresolvable_remote_is_reported() {
    let err = ForwardingListener::bind(LOCALHOST, "no-such-host.invalid", 80).unwrap_err();
    assert!(
        matches!(err, ForwardError::Resolve { .. } | ForwardError::NoAddress(_)),
        "got {:?}",
        err
    );
}

/// Needs outbound Internet access
#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_http_head_through_forwarder() {
    let listener = ForwardingListener::bind(LOCALHOST, "example.com", 80).unwrap();

    let mut client = connect(listener.listening_port()).await;
    client
        .write_all(b"HEAD / HTTP/1.0\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(30), client.read_to_end(&mut response))
        .await
        .expect("no response from example.com")
        .unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1."), "unexpected response: {}", text);
    assert!(text.contains(" 200 ") || text.contains(" 301 ") || text.contains(" 302 "));

    listener.shutdown().unwrap();
}
