//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use handoff::net::{connection_handler, CloseRequest, CloseSignal, ConnectionHandler};
use handoff::protocol::frame::encode_frame;
use handoff::protocol::{ControlMessage, FrameCodec};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Greets, echoes lines, answers a graceful close with `close handshake`.
pub fn echo_handler() -> ConnectionHandler {
    connection_handler(|stream: TcpStream, _peer: SocketAddr, mut signal: CloseSignal| async move {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        if write.write_all(b"hello\n").await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    _ => return,
                },
                request = signal.changed() => {
                    if request == CloseRequest::Graceful {
                        let _ = write.write_all(b"close handshake\n").await;
                        return;
                    }
                }
            }
        }
    })
}

/// Greets, then ignores everything, including graceful close requests.
pub fn stubborn_handler() -> ConnectionHandler {
    connection_handler(|mut stream: TcpStream, _peer: SocketAddr, _signal: CloseSignal| async move {
        let _ = stream.write_all(b"hello\n").await;
        std::future::pending::<()>().await;
    })
}

/// Connect and consume the greeting line.
pub async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = tokio::time::timeout(WAIT, TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let mut client = BufReader::new(stream);
    assert_eq!(read_line(&mut client).await.as_deref(), Some("hello"));
    client
}

/// Next line without its terminator; `None` on EOF or reset.
pub async fn read_line(client: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    match tokio::time::timeout(WAIT, client.read_line(&mut line)).await.expect("read timed out") {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end().to_string()),
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Write one control message as a frame.
pub async fn write_message(writer: &mut (impl AsyncWrite + Unpin), message: &ControlMessage) {
    let mut buf = BytesMut::new();
    encode_frame(&message.to_payload().unwrap(), &mut buf).unwrap();
    writer.write_all(&buf).await.unwrap();
    writer.flush().await.unwrap();
}

/// Read frames until one control message decodes.
pub async fn read_message(reader: &mut (impl AsyncRead + Unpin), codec: &mut FrameCodec) -> ControlMessage {
    let mut buf = vec![0u8; 1024];
    loop {
        if let Some(frame) = codec.pull().unwrap() {
            return ControlMessage::from_payload(frame.payload()).unwrap();
        }
        let n = tokio::time::timeout(WAIT, reader.read(&mut buf))
            .await
            .expect("control read timed out")
            .unwrap();
        assert!(n > 0, "control channel closed");
        codec.feed(bytes::Bytes::copy_from_slice(&buf[..n]));
    }
}
