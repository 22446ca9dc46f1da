//! I/O loop lifecycle: exit when idle, restart on demand.
//!
//! Kept as a single test so nothing else in this binary keeps the loop alive.

mod common;

use common::{start_echo_server, LOCALHOST};
use rustforward::{event_loop, ForwardingListener};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn exited(limit: Duration) -> bool {
    tokio::task::spawn_blocking(move || event_loop::wait_for_exit_timeout(limit))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loop_exits_when_idle_and_restarts() {
    let echo_port = start_echo_server().await;
    assert!(exited(Duration::from_secs(1)).await);

    // First generation runs while the listener is open
    let first = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    assert!(event_loop::is_running());
    assert_eq!(event_loop::current_generation(), Some(first.generation()));

    assert!(first.shutdown().unwrap());
    assert!(exited(Duration::from_secs(5)).await, "loop did not exit once idle");
    assert!(!event_loop::is_running());
    assert_eq!(event_loop::current_generation(), None);
    assert_eq!(event_loop::generation(), first.generation());

    // Shutting down again must not start a new loop
    assert!(!first.shutdown().unwrap());
    assert!(!event_loop::is_running());

    // Next start launches a fresh generation
    let second = ForwardingListener::bind(LOCALHOST, "127.0.0.1", echo_port).unwrap();
    assert_eq!(second.generation(), first.generation() + 1);
    assert!(event_loop::is_running());

    // A live relay pair keeps the loop running after its listener closed
    let mut client = TcpStream::connect(("127.0.0.1", second.listening_port()))
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert!(second.shutdown().unwrap());
    assert!(!exited(Duration::from_millis(300)).await);
    assert!(event_loop::is_running());

    drop(client);
    assert!(exited(Duration::from_secs(5)).await, "loop outlived its last pair");
    assert_eq!(second.stats().closed_pairs, 1);
}
