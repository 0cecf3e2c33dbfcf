//! Tests for copying backend responses back to the caller

mod common;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use common::{CallerResponse, spawn_backend};
use teeproxy::config::BackendConfig;
use teeproxy::error::RelayError;
use teeproxy::http::body::{Body, Framing};
use teeproxy::http::request::{ForwardRequest, Method};
use teeproxy::proxy::{BackendClient, BackendResponse, relay};
use tokio::io::AsyncWrite;

const CHUNKED: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Backend: a\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

async fn fetch(response: &'static [u8], method: Method) -> BackendResponse {
    let (addr, _rx) = spawn_backend(response).await;
    let client = BackendClient::new(
        BackendConfig::new(addr.to_string()).with_timeout(Duration::from_secs(2)),
    )
    .unwrap();

    client
        .send(ForwardRequest {
            method,
            path: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            host: "caller.example".to_string(),
            body: Bytes::new(),
            close: true,
        })
        .await
        .unwrap()
}

async fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut decoded = Body::new(body, Framing::Chunked);
    let mut out = Vec::new();
    while let Some(chunk) = decoded.next_chunk().await.unwrap() {
        out.extend_from_slice(&chunk);
    }
    assert!(decoded.is_done());
    out
}

/// A caller whose connection is already gone.
struct BrokenCaller;

impl AsyncWrite for BrokenCaller {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_relay_length_delimited() {
    let response = fetch(
        b"HTTP/1.1 201 Created\r\nContent-Length: 4\r\nX-Trace: abc\r\n\r\ndone",
        Method::POST,
    )
    .await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert_eq!(outcome.status.as_u16(), 201);
    assert_eq!(outcome.body_bytes, 4);
    assert!(outcome.keep_alive);

    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.status_line, "HTTP/1.1 201 Created");
    assert_eq!(seen.header("x-trace"), Some("abc"));
    assert_eq!(seen.header("content-length"), Some("4"));
    assert_eq!(seen.body, b"done");
}

#[tokio::test]
async fn test_relay_rechunks_for_http11_caller() {
    let response = fetch(CHUNKED, Method::GET).await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert_eq!(outcome.body_bytes, 11);
    assert!(outcome.keep_alive);

    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.header("transfer-encoding"), Some("chunked"));
    assert_eq!(seen.header("x-backend"), Some("a"));
    assert!(seen.body.ends_with(b"0\r\n\r\n"));
    assert_eq!(dechunk(&seen.body).await, b"hello world");
}

#[tokio::test]
async fn test_relay_unframes_chunked_for_http10_caller() {
    let response = fetch(CHUNKED, Method::GET).await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.0", false).await.unwrap();

    assert!(!outcome.keep_alive);

    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.header("transfer-encoding"), None);
    assert_eq!(seen.body, b"hello world");
}

#[tokio::test]
async fn test_relay_eof_delimited_closes_caller() {
    let response = fetch(b"HTTP/1.1 200 OK\r\n\r\nstream until close", Method::GET).await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert!(!outcome.keep_alive);
    assert_eq!(CallerResponse::parse(&caller).body, b"stream until close");
}

#[tokio::test]
async fn test_relay_backend_close_ends_keep_alive() {
    let response = fetch(
        b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
        Method::GET,
    )
    .await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert!(!outcome.keep_alive);
    assert_eq!(CallerResponse::parse(&caller).header("connection"), Some("close"));
}

#[tokio::test]
async fn test_relay_custom_reason_preserved() {
    let response = fetch(
        b"HTTP/1.1 503 Back Soon\r\nContent-Length: 0\r\n\r\n",
        Method::GET,
    )
    .await;

    let mut caller = Vec::new();
    relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert_eq!(CallerResponse::parse(&caller).status_line, "HTTP/1.1 503 Back Soon");
}

#[tokio::test]
async fn test_relay_caller_write_error() {
    let response = fetch(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", Method::GET).await;

    let result = relay(response, &mut BrokenCaller, "HTTP/1.1", true).await;

    match result {
        Err(RelayError::RelayWrite(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected a relay write error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_truncated_backend_body() {
    let response = fetch(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", Method::GET).await;

    let mut caller = Vec::new();
    let result = relay(response, &mut caller, "HTTP/1.1", true).await;

    assert!(matches!(result, Err(RelayError::Read { .. })));
    // Head and the bytes received before the failure already went out
    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.status(), 200);
    assert_eq!(seen.body, b"abc");
}

#[tokio::test]
async fn test_relay_announces_close_from_http10_backend() {
    let response = fetch(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok", Method::GET).await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", true).await.unwrap();

    assert!(!outcome.keep_alive);
    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.status_line, "HTTP/1.1 200 OK");
    assert_eq!(seen.header("connection"), Some("close"));
    assert_eq!(seen.body, b"ok");
}

#[tokio::test]
async fn test_relay_caller_closing_overrides_backend_keep_alive() {
    let response = fetch(
        b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nok",
        Method::GET,
    )
    .await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.1", false).await.unwrap();

    assert!(!outcome.keep_alive);
    let seen = CallerResponse::parse(&caller);
    assert_eq!(seen.header("connection"), Some("close"));
    assert_eq!(seen.headers.len(), 2);
}

#[tokio::test]
async fn test_relay_keeps_http10_caller_alive_when_asked() {
    let response = fetch(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", Method::GET).await;

    let mut caller = Vec::new();
    let outcome = relay(response, &mut caller, "HTTP/1.0", true).await.unwrap();

    assert!(outcome.keep_alive);
    assert_eq!(
        CallerResponse::parse(&caller).header("connection"),
        Some("keep-alive")
    );
}
