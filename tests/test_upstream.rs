//! Tests for upstream request building and the backend client

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{closed_addr, next_request, spawn_backend, spawn_silent_backend};
use teeproxy::config::BackendConfig;
use teeproxy::error::RelayError;
use teeproxy::http::body::Framing;
use teeproxy::http::request::{ForwardRequest, Method};
use teeproxy::proxy::upstream::{BackendClient, build_http_request};
use tokio::io::AsyncWriteExt;

fn forward(method: Method, path: &str, headers: &[(&str, &str)], body: &'static [u8]) -> ForwardRequest {
    ForwardRequest {
        method,
        path: path.to_string(),
        version: "HTTP/1.1".to_string(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        host: "example.com".to_string(),
        body: Bytes::from_static(body),
        close: true,
    }
}

fn client(addr: std::net::SocketAddr, timeout: Duration) -> BackendClient {
    BackendClient::new(BackendConfig::new(addr.to_string()).with_timeout(timeout)).unwrap()
}

#[test]
fn test_build_http_request() {
    let request = forward(Method::GET, "/api/users", &[("User-Agent", "Test")], b"");
    let request_str = String::from_utf8(build_http_request(&request)).unwrap();

    assert!(request_str.starts_with("GET /api/users HTTP/1.1\r\n"));
    assert!(request_str.contains("Host: example.com\r\n"));
    assert!(request_str.contains("User-Agent: Test\r\n"));
    assert!(request_str.contains("Connection: close\r\n"));
    assert!(!request_str.contains("Content-Length"));
    assert!(request_str.ends_with("\r\n\r\n"));
}

#[test]
fn test_build_http_request_with_body() {
    let request = forward(
        Method::POST,
        "/api/data",
        &[("Content-Type", "application/json"), ("Content-Length", "2")],
        b"{}",
    );
    let request_str = String::from_utf8(build_http_request(&request)).unwrap();

    assert!(request_str.starts_with("POST /api/data HTTP/1.1\r\n"));
    assert!(request_str.contains("Content-Type: application/json\r\n"));
    assert_eq!(request_str.matches("Content-Length").count(), 1);
    assert!(request_str.contains("Content-Length: 2\r\n"));
    assert!(request_str.ends_with("\r\n\r\n{}"));
}

#[test]
fn test_build_http_request_removes_hop_by_hop_headers() {
    let request = forward(
        Method::GET,
        "/",
        &[
            ("Connection", "keep-alive"),
            ("Upgrade", "websocket"),
            ("Keep-Alive", "timeout=5"),
            ("Expect", "100-continue"),
            ("host", "stale.example"),
            ("User-Agent", "Test"),
        ],
        b"",
    );
    let request_str = String::from_utf8(build_http_request(&request)).unwrap();

    assert!(request_str.contains("Connection: close"));
    assert!(!request_str.contains("keep-alive"));
    assert!(!request_str.contains("Upgrade: websocket"));
    assert!(!request_str.contains("Expect"));
    assert!(!request_str.contains("stale.example"));
    assert!(request_str.contains("User-Agent: Test"));
}

#[test]
fn test_build_http_request_default_path() {
    let request = forward(Method::GET, "", &[], b"");
    let request_str = String::from_utf8(build_http_request(&request)).unwrap();

    assert!(request_str.starts_with("GET / HTTP/1.1\r\n"));
}

#[test]
fn test_build_http_request_keeps_extension_method_and_query() {
    let request = forward(Method::Extension("PROPFIND".into()), "/dav?depth=1", &[], b"");
    let request_str = String::from_utf8(build_http_request(&request)).unwrap();

    assert!(request_str.starts_with("PROPFIND /dav?depth=1 HTTP/1.1\r\n"));
}

#[test]
fn test_client_rejects_bad_host() {
    assert!(BackendClient::new(BackendConfig::new("")).is_err());
    assert!(BackendClient::new(BackendConfig::new("host/with/path")).is_err());
}

#[tokio::test]
async fn test_send_reads_length_delimited_response() {
    let (addr, mut rx) =
        spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhello").await;
    let client = client(addr, Duration::from_secs(2));

    let mut response = client
        .send(forward(Method::POST, "/echo", &[], b"ping"))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.head.header("x-test"), Some("yes"));
    assert_eq!(response.framing(), Framing::Length(5));
    assert_eq!(response.next_chunk().await.unwrap().unwrap(), &b"hello"[..]);
    assert!(response.next_chunk().await.unwrap().is_none());
    response.release().await;

    let captured = next_request(&mut rx).await;
    assert_eq!(captured.request_line, "POST /echo HTTP/1.1");
    assert_eq!(captured.body, b"ping");
}

#[tokio::test]
async fn test_send_skips_interim_responses() {
    let (addr, _rx) = spawn_backend(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let client = client(addr, Duration::from_secs(2));

    let response = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap();

    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(response.framing(), Framing::Empty);
    response.release().await;
}

#[tokio::test]
async fn test_send_treats_eof_after_unframed_body_as_normal_close() {
    let (addr, _rx) = spawn_backend(b"HTTP/1.1 200 OK\r\n\r\nuntil the end").await;
    let client = client(addr, Duration::from_secs(2));

    let mut response = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap();

    assert_eq!(response.framing(), Framing::UntilEof);
    assert_eq!(response.drain().await.unwrap(), 13);
    response.release().await;
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let (addr, _rx) = spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n").await;
    let client = client(addr, Duration::from_secs(2));

    let mut response = client.send(forward(Method::HEAD, "/", &[], b"")).await.unwrap();

    assert_eq!(response.framing(), Framing::Empty);
    assert_eq!(response.drain().await.unwrap(), 0);
    response.release().await;
}

#[tokio::test]
async fn test_send_dial_error() {
    let addr = closed_addr().await;
    let client = client(addr, Duration::from_secs(2));

    let err = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap_err();

    assert!(matches!(err, RelayError::Dial { .. }));
    assert!(err.is_backend());
    assert!(err.to_string().contains(&addr.to_string()));
}

#[tokio::test]
async fn test_send_read_error_on_malformed_response() {
    let (addr, _rx) = spawn_backend(b"SMTP ready\r\n\r\n").await;
    let client = client(addr, Duration::from_secs(2));

    let err = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap_err();

    assert!(matches!(err, RelayError::Read { .. }));
}

#[tokio::test]
async fn test_send_read_error_on_early_close() {
    let (addr, _rx) = spawn_backend(b"HTTP/1.1 200 OK\r\n").await;
    let client = client(addr, Duration::from_secs(2));

    let err = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap_err();

    assert!(matches!(err, RelayError::Read { .. }));
}

#[tokio::test]
async fn test_send_times_out_waiting_for_response() {
    let (addr, _rx) = spawn_silent_backend().await;
    let client = client(addr, Duration::from_millis(200));

    let started = Instant::now();
    let err = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(180));
    match err {
        RelayError::Read { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut)
        }
        other => panic!("expected read timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_body_is_a_read_error() {
    let (addr, _rx) = spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").await;
    let client = client(addr, Duration::from_secs(2));

    let mut response = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap();
    let err = response.drain().await.unwrap_err();
    response.release().await;

    assert!(matches!(err, RelayError::Read { .. }));
}

#[tokio::test]
async fn test_endless_interim_responses_time_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            if socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    let client = client(addr, Duration::from_millis(300));

    let started = Instant::now();
    let err = client.send(forward(Method::GET, "/", &[], b"")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    match err {
        RelayError::Read { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut)
        }
        other => panic!("expected read timeout, got {other:?}"),
    }
}
