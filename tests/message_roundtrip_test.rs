mod common;

use std::io::Write;

use bytes::Bytes;
use common::*;
use framewire::{AppError, ChannelState, FrameHeader, FrameMode, SendElement, SocketEvent};
use rstest::rstest;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

#[rstest]
#[case(0)]
#[case(1)]
#[case(64 * 1024)]
#[tokio::test]
async fn test_full_mode_round_trip(#[case] len: usize) {
    let srv = start_server(local_config()).await;
    srv.spawn_echo();

    let (client, events) = connect_client(srv.addr, local_config()).await;
    let payload = patterned_payload(len);
    client.send(Bytes::from(payload.clone())).await.unwrap();

    let echoed = next_message(&events).await;
    assert_eq!(echoed, payload);

    client.close().await.unwrap();
    srv.shutdown().await;
}

#[tokio::test]
async fn test_two_frames_in_one_write_deliver_in_order() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let mut socket = TcpStream::connect(srv.addr).await.unwrap();
    socket.set_nodelay(true).unwrap();
    let mut wire = Vec::new();
    for payload in [b"first".as_slice(), b"second".as_slice()] {
        wire.extend_from_slice(&FrameHeader::new(FrameMode::Full, payload.len() as u32).encode());
        wire.extend_from_slice(payload);
    }
    socket.write_all(&wire).await.unwrap();
    socket.flush().await.unwrap();

    assert_eq!(next_server_message(&events).await, b"first".as_slice());
    assert_eq!(next_server_message(&events).await, b"second".as_slice());
    srv.shutdown().await;
}

#[tokio::test]
async fn test_header_written_one_byte_at_a_time() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let mut socket = TcpStream::connect(srv.addr).await.unwrap();
    socket.set_nodelay(true).unwrap();
    let payload = b"split header payload";
    let header = FrameHeader::new(FrameMode::Full, payload.len() as u32).encode();
    for byte in header {
        socket.write_all(&[byte]).await.unwrap();
        socket.flush().await.unwrap();
        sleep(Duration::from_millis(10)).await;
    }
    socket.write_all(payload).await.unwrap();
    socket.flush().await.unwrap();

    assert_eq!(next_server_message(&events).await, payload.as_slice());
    srv.shutdown().await;
}

#[tokio::test]
async fn test_once_mode_streams_chunks() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let (client, _client_events) = connect_client(srv.addr, local_config()).await;
    let payload = patterned_payload(100_000);
    client.send_once(Bytes::from(payload.clone())).await.unwrap();

    let mut reassembled = Vec::new();
    let mut last_received = 0u32;
    loop {
        match recv_server_event(&events).await.event {
            SocketEvent::Chunk {
                total_len,
                received_len,
                chunk,
            } => {
                assert_eq!(total_len, payload.len() as u32);
                assert_eq!(received_len, last_received + chunk.len() as u32);
                last_received = received_len;
                reassembled.extend_from_slice(&chunk);
                if received_len == total_len {
                    break;
                }
            }
            SocketEvent::Accepted | SocketEvent::StateChanged { .. } => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(last_received, payload.len() as u32);
    assert_eq!(reassembled, payload);

    client.close().await.unwrap();
    srv.shutdown().await;
}

#[tokio::test]
async fn test_multi_send_combines_buffers_and_files() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let (client, _client_events) = connect_client(srv.addr, local_config()).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let file_body = patterned_payload(8 * 1024);
    file.write_all(&file_body).unwrap();
    file.flush().unwrap();

    client
        .send_multi(vec![
            SendElement::Buffer(Bytes::from_static(b"head:")),
            SendElement::File(file.path().to_path_buf()),
            SendElement::Buffer(Bytes::from_static(b":tail")),
        ])
        .await
        .unwrap();

    let mut expected = b"head:".to_vec();
    expected.extend_from_slice(&file_body);
    expected.extend_from_slice(b":tail");
    assert_eq!(next_server_message(&events).await, expected);

    client.close().await.unwrap();
    srv.shutdown().await;
}

#[tokio::test]
async fn test_multi_send_overflow_fails_before_sending() {
    let srv = start_server(local_config()).await;
    srv.spawn_echo();

    let (client, events) = connect_client(srv.addr, local_config()).await;

    // sparse file, no actual disk usage
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(u32::MAX as u64).unwrap();
    let result = client
        .send_multi(vec![
            SendElement::File(file.path().to_path_buf()),
            SendElement::Buffer(Bytes::from_static(b"overflow")),
        ])
        .await;
    match result {
        Err(AppError::FrameTooLarge(_)) => {}
        other => panic!("expected frame too large, got {:?}", other),
    }

    // the connection survives a rejected send
    client.send(Bytes::from_static(b"still alive")).await.unwrap();
    assert_eq!(next_message(&events).await, b"still alive".as_slice());

    client.close().await.unwrap();
    srv.shutdown().await;
}

#[tokio::test]
async fn test_invalid_mode_byte_closes_connection() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let mut socket = TcpStream::connect(srv.addr).await.unwrap();
    let mut wire = vec![9u8];
    wire.extend_from_slice(&3u32.to_be_bytes());
    wire.extend_from_slice(b"abc");
    socket.write_all(&wire).await.unwrap();
    socket.flush().await.unwrap();

    let mut saw_failed = false;
    loop {
        let event = recv_server_event(&events).await;
        match event.event {
            SocketEvent::Message { .. } | SocketEvent::Chunk { .. } => {
                panic!("corrupt stream must not deliver payload events")
            }
            SocketEvent::StateChanged {
                state: ChannelState::Failed,
                error,
            } => {
                assert!(error.is_some());
                saw_failed = true;
            }
            SocketEvent::StateChanged {
                state: ChannelState::Closed,
                ..
            } => break,
            _ => {}
        }
    }
    assert!(saw_failed);

    // the server forgets the connection once it is torn down
    timeout(Duration::from_secs(5), async {
        while srv.server.connection_count() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should be removed after corruption");

    srv.shutdown().await;
}

#[tokio::test]
async fn test_messages_interleave_with_streamed_frames() {
    let srv = start_server(local_config()).await;
    let events = srv.server.events();

    let (client, _client_events) = connect_client(srv.addr, local_config()).await;
    client.send(Bytes::from_static(b"before")).await.unwrap();
    client.send_once(Bytes::from_static(b"streamed")).await.unwrap();
    client.send(Bytes::from_static(b"after")).await.unwrap();

    let mut messages = Vec::new();
    let mut streamed = Vec::new();
    while messages.len() < 2 || streamed.is_empty() {
        match recv_server_event(&events).await.event {
            SocketEvent::Message { payload } => messages.push(payload),
            SocketEvent::Chunk { chunk, .. } => streamed.extend_from_slice(&chunk),
            _ => {}
        }
    }
    assert_eq!(messages[0], b"before".as_slice());
    assert_eq!(messages[1], b"after".as_slice());
    assert_eq!(streamed, b"streamed");

    client.close().await.unwrap();
    srv.shutdown().await;
}
