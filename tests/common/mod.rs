//! Fake backends and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use teeproxy::http::body::Body;
use teeproxy::http::parser::parse_http_request;
use teeproxy::http::request::InboundRequest;

/// A request as seen by a fake backend.
#[derive(Debug, Clone)]
pub struct Captured {
    pub request_line: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// Reads one Content-Length framed request off a socket.
async fn read_request<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Option<Captured> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (k, v) = line.split_once(':')?;
        headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
    }

    let len: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await.ok()?;

    Some(Captured {
        request_line: request_line.trim_end().to_string(),
        headers,
        body,
    })
}

/// Spawns a backend that answers every request with `response` and reports
/// each request it received on the returned channel.
pub async fn spawn_backend(response: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
    spawn_backend_with_delay(response, Duration::ZERO).await
}

/// Like [`spawn_backend`], but waits `delay` before answering.
pub async fn spawn_backend_with_delay(
    response: &'static [u8],
    delay: Duration,
) -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut socket = BufReader::new(socket);
                if let Some(captured) = read_request(&mut socket).await {
                    let _ = tx.send(captured);
                    tokio::time::sleep(delay).await;
                    let _ = socket.get_mut().write_all(response).await;
                }
                let _ = socket.get_mut().shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Spawns a backend that accepts connections and reads requests but never answers.
pub async fn spawn_silent_backend() -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut socket = BufReader::new(socket);
                if let Some(captured) = read_request(&mut socket).await {
                    let _ = tx.send(captured);
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });

    (addr, rx)
}

/// An address nothing is listening on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Waits for the next captured request, failing the test after a few seconds.
pub async fn next_request(rx: &mut mpsc::UnboundedReceiver<Captured>) -> Captured {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("backend did not receive a request in time")
        .expect("backend channel closed")
}

/// Builds an inbound request from a raw head and an in-memory body.
pub fn inbound<'a>(raw_head: &str, body: &'a [u8]) -> InboundRequest<&'a [u8]> {
    let (head, _) = parse_http_request(raw_head.as_bytes()).unwrap();
    let framing = head.body_framing().unwrap();
    InboundRequest::new(head, Body::new(body, framing))
}

/// A response as seen by the caller.
#[derive(Debug)]
pub struct CallerResponse {
    pub status_line: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl CallerResponse {
    pub fn parse(raw: &[u8]) -> Self {
        let end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response head terminator");
        let head = std::str::from_utf8(&raw[..end]).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        Self {
            status_line,
            headers,
            body: raw[end + 4..].to_vec(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .and_then(|c| c.parse().ok())
            .unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}
