#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use sni_router::events::{TrafficEvent, TrafficSink};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A TLS 1.2 ClientHello record carrying `hostname` as SNI.
pub fn client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    let mut server_name = Vec::new();
    server_name.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    server_name.push(0x00);
    server_name.extend_from_slice(&(name.len() as u16).to_be_bytes());
    server_name.extend_from_slice(name);

    let mut extensions = Vec::new();
    // supported_versions first, so the parser has to skip an extension
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Sink that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TrafficEvent>>,
    next: AtomicU64,
    pub upstream_errors: AtomicUsize,
    pub listener_errors: AtomicUsize,
}

impl TrafficSink for RecordingSink {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, event: TrafficEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn listener_error(&self, _local_port: u16, _message: String) {
        self.listener_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn upstream_error(&self, _local_port: u16, _message: String) {
        self.upstream_errors.fetch_add(1, Ordering::SeqCst);
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<TrafficEvent> {
        self.events().into_iter().filter(|e| e.is_closed()).collect()
    }

    /// Wait until at least `count` closed events arrived.
    pub async fn wait_closed(&self, count: usize) -> Vec<TrafficEvent> {
        for _ in 0..200 {
            let closed = self.closed();
            if closed.len() >= count {
                return closed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} closed events: {:?}", count, self.events());
    }
}

/// Read one HTTP head (up to the blank line) from `stream`.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// A port that was free a moment ago.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Origin that answers every request with `body` and reports request heads.
pub async fn http_origin(body: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let mut request_body = vec![0u8; content_length(&head)];
                let _ = stream.read_exact(&mut request_body).await;
                let _ = tx.send(head);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (port, rx)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Origin that echoes everything back.
pub async fn echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Upstream proxy: reports request heads, accepts CONNECT and then echoes,
/// answers plain requests with `via-upstream`.
pub async fn fake_upstream() -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let is_connect = head.starts_with("CONNECT ");
                let _ = tx.send(head);
                if is_connect {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await;
                    let (mut reader, mut writer) = stream.into_split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                } else {
                    let body = "via-upstream";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });
    (port, rx)
}

/// Open a CONNECT tunnel through a local listener and return the stream
/// after the 200 response head.
pub async fn open_connect(local_port: u16, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Receive the next item or fail after two seconds.
pub async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}
