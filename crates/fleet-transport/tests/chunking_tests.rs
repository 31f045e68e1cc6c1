//! End-to-end tests of framing over in-memory duplex pipes.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use fleet_transport::{
    Connection, ConnectionEvent, ConnectionState, Frame, FrameCodec, FrameKind, TransportError,
    TransportEvent,
};

async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> TransportEvent {
    rx.recv().await.expect("event channel closed").event
}

#[tokio::test]
async fn test_large_message_goes_out_as_fixed_chunks_with_single_fin() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    let message: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    conn.send(Bytes::from(message.clone())).await.unwrap();

    let mut frames = FramedRead::new(remote, FrameCodec::new());
    let mut received = Vec::new();
    let mut sizes = Vec::new();
    loop {
        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        sizes.push(frame.payload.len());
        received.extend_from_slice(&frame.payload);
        if frame.fin {
            break;
        }
    }

    assert_eq!(sizes, vec![1024, 1024, 452]);
    assert_eq!(received, message);
}

#[tokio::test]
async fn test_message_is_reassembled_across_frames() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    let mut writer = FramedWrite::new(remote, FrameCodec::new());
    writer.send(Frame::data(Bytes::from_static(b"{\"a\":"), false)).await.unwrap();
    writer.send(Frame::data(Bytes::from_static(b"1}"), true)).await.unwrap();

    match next(&mut rx).await {
        TransportEvent::Message(bytes) => {
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["a"], 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_connections_exchange_messages_in_order() {
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let a = Connection::with_chunk_size("b:1", tx_a, 16);
    let b = Connection::new("a:1", tx_b);
    let (pipe_a, pipe_b) = tokio::io::duplex(1024);
    a.attach(pipe_a, Some(Bytes::from_static(b"hello"))).unwrap();
    b.attach(pipe_b, None).unwrap();
    assert_eq!(next(&mut rx_a).await, TransportEvent::Open);
    assert_eq!(next(&mut rx_b).await, TransportEvent::Open);

    let long = Bytes::from(vec![b'x'; 100]);
    a.send(long.clone()).await.unwrap();

    assert_eq!(next(&mut rx_b).await, TransportEvent::Message(Bytes::from_static(b"hello")));
    assert_eq!(next(&mut rx_b).await, TransportEvent::Message(long));
}

#[tokio::test]
async fn test_peer_close_frame_raises_closed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, remote) = tokio::io::duplex(1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    let mut writer = FramedWrite::new(remote, FrameCodec::new());
    writer.send(Frame::close()).await.unwrap();

    assert_eq!(next(&mut rx).await, TransportEvent::Closed);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_local_close_sends_close_frame_and_stops_receiving() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, remote) = tokio::io::duplex(1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    conn.close();
    assert_eq!(next(&mut rx).await, TransportEvent::Closed);

    let (read_half, write_half) = tokio::io::split(remote);
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let frame = frames.next().await.unwrap().unwrap();
    assert_eq!(frame.kind, FrameKind::Close);

    // Data arriving after close is never surfaced.
    let mut writer = FramedWrite::new(write_half, FrameCodec::new());
    let _ = writer.send(Frame::data(Bytes::from_static(b"late"), true)).await;
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());

    let err = conn.send(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, TransportError::NotOpen(_)));
}

#[tokio::test]
async fn test_stream_end_without_close_frame_is_closed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, remote) = tokio::io::duplex(1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    drop(remote);
    assert_eq!(next(&mut rx).await, TransportEvent::Closed);
}

#[tokio::test]
async fn test_malformed_frame_raises_error() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::new("peer:1", tx);
    let (local, mut remote) = tokio::io::duplex(1024);
    conn.attach(local, None).unwrap();
    assert_eq!(next(&mut rx).await, TransportEvent::Open);

    tokio::io::AsyncWriteExt::write_all(&mut remote, &[0xff, 0, 0, 0, 0])
        .await
        .unwrap();
    match next(&mut rx).await {
        TransportEvent::Error(reason) => assert!(reason.contains("frame flags")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(!conn.info().is_empty());
}
