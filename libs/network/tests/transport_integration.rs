//! Integration Tests for Framed Transports
//!
//! Exercises the TCP and in-process transports through the same
//! `Acceptor`/`Connector` boundary the dispatch core uses.

use std::time::Duration;
use tokio::time::timeout;

use network::{Acceptor, Connection, Connector, LocalAcceptor, TcpAcceptor, TcpConfig, TcpConnector};

async fn echo_once(connection: Connection) {
    let (_, mut sink, mut source) = connection.into_split();
    while let Some(frame) = source.recv_frame().await.unwrap() {
        sink.send_frame(&frame).await.unwrap();
    }
    sink.close().await.unwrap();
}

async fn round_trip(client: Connection, frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let (_, mut sink, mut source) = client.into_split();
    for frame in frames {
        sink.send_frame(frame).await.unwrap();
    }
    sink.close().await.unwrap();

    let mut echoed = Vec::new();
    while let Some(frame) = timeout(Duration::from_secs(5), source.recv_frame())
        .await
        .expect("echo timed out")
        .unwrap()
    {
        echoed.push(frame.to_vec());
    }
    echoed
}

fn sample_frames() -> Vec<Vec<u8>> {
    vec![b"first".to_vec(), Vec::new(), vec![7u8; 70_000], b"last".to_vec()]
}

#[tokio::test]
async fn test_tcp_echo_preserves_order() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
        .await
        .unwrap();
    let address = acceptor.local_addr().to_string();
    let server = tokio::spawn(async move { echo_once(acceptor.accept().await.unwrap()).await });

    let client = TcpConnector::default().connect(&address).await.unwrap();
    let frames = sample_frames();
    assert_eq!(round_trip(client, &frames).await, frames);
    server.await.unwrap();
}

#[tokio::test]
async fn test_local_echo_preserves_order() {
    let (mut acceptor, connector) = LocalAcceptor::new("echo");
    let server = tokio::spawn(async move { echo_once(acceptor.accept().await.unwrap()).await });

    let client = connector.connect("client").await.unwrap();
    let frames = sample_frames();
    assert_eq!(round_trip(client, &frames).await, frames);
    server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_receiver_rejects_oversized_frame() {
    let small = TcpConfig {
        max_message_size: 16,
        ..Default::default()
    };
    let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), small).await.unwrap();
    let address = acceptor.local_addr().to_string();
    let server = tokio::spawn(async move {
        let (_, _, mut source) = acceptor.accept().await.unwrap().into_split();
        source.recv_frame().await
    });

    // Sender allows larger frames than the receiver
    let (_, mut sink, _source) = TcpConnector::default().connect(&address).await.unwrap().into_split();
    sink.send_frame(&[1u8; 64]).await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert_eq!(err.category(), "protocol");
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
        .await
        .unwrap();
    let address = acceptor.local_addr().to_string();
    drop(acceptor);

    let connector = TcpConnector::new(TcpConfig {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    assert!(connector.connect(&address).await.is_err());
}
