#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use ev3_cockpit::protocol::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    hex::decode(hex.replace(' ', "")).expect("valid hex in test data")
}

/// What a fake brick does with one decoded request packet: either write
/// the given `(delay_ms, frame)` list, or `None` to drop the connection.
pub type BrickScript = Arc<dyn Fn(&Packet) -> Option<Vec<(u64, Vec<u8>)>> + Send + Sync>;

/// Replies to every request with `DIRECT_REPLY` carrying `payload`,
/// echoing the request counter.
pub fn echo_script(payload: Vec<u8>) -> BrickScript {
    Arc::new(move |request| {
        let reply = Packet::new(
            request.message_counter,
            ev3_cockpit::protocol::packet::DIRECT_REPLY,
            payload.clone(),
        )
        .encode()
        .expect("test reply encodes");
        Some(vec![(0, reply)])
    })
}

pub struct FakeBrick {
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

impl Drop for FakeBrick {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A TCP server speaking the unlock handshake followed by length-prefixed
/// frames. Accepts any number of sequential connections so rejected
/// handshakes and reopen tests work.
pub async fn spawn_fake_brick(handshake_response: &'static str, script: BrickScript) -> FakeBrick {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral listener");
    let addr = listener.local_addr().expect("listener addr");
    let server = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let script = script.clone();
            tokio::spawn(serve_connection(stream, handshake_response, script));
        }
    });
    FakeBrick { addr, server }
}

async fn serve_connection(mut stream: TcpStream, handshake_response: &str, script: BrickScript) {
    // Consume the unlock request up to its blank line.
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => request.push(byte[0]),
        }
        if request.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    if stream
        .write_all(handshake_response.as_bytes())
        .await
        .is_err()
    {
        return;
    }

    loop {
        let mut prefix = [0u8; 2];
        if stream.read_exact(&mut prefix).await.is_err() {
            return;
        }
        let body_len = u16::from_le_bytes(prefix) as usize;
        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let mut frame = prefix.to_vec();
        frame.extend_from_slice(&body);
        let Ok(request) = Packet::decode(&frame) else {
            continue;
        };
        match script(&request) {
            Some(replies) => {
                for (delay_ms, bytes) in replies {
                    if delay_ms > 0 {
                        sleep(Duration::from_millis(delay_ms)).await;
                    }
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            }
            None => return, // drop the connection
        }
    }
}
