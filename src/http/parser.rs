use std::collections::HashMap;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::http::request::{Method, RequestHead};
use crate::http::response::{ResponseHead, StatusCode};

/// Upper bound on the size of a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("invalid method")]
    InvalidMethod,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid status line")]
    InvalidStatus,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("incomplete message head")]
    Incomplete,
}

impl From<ParseError> for io::Error {
    fn from(e: ParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Parses a request head. Returns the head and the number of bytes it used.
pub fn parse_http_request(buf: &[u8]) -> Result<(RequestHead, usize), ParseError> {
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    check_version(version)?;

    let request = RequestHead {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers: parse_headers(lines)?,
    };

    Ok((request, headers_end + 4))
}

/// Parses a response head. Returns the head and the number of bytes it used.
pub fn parse_http_response(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidStatus)?;

    let mut lines = headers_str.split("\r\n");

    // Status line: version, code, optional reason phrase
    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    check_version(version)?;

    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or(ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or("").trim();

    let response = ResponseHead {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers: parse_headers(lines)?,
    };

    Ok((response, headers_end + 4))
}

fn check_version(version: &str) -> Result<(), ParseError> {
    match version {
        "HTTP/1.0" | "HTTP/1.1" => Ok(()),
        _ => Err(ParseError::UnsupportedVersion),
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>, ParseError> {
    let mut headers = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeader);
        }

        headers.insert(key.to_string(), value.trim().to_string());
    }

    Ok(headers)
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads raw head bytes, up to and including the blank line.
///
/// Empty lines before the head are skipped. Returns `Ok(None)` when the
/// stream ends cleanly before any byte of a head arrives.
pub async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);

    loop {
        let limit = (MAX_HEAD_SIZE - buf.len()) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head too large",
                ));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a message head",
            ));
        }

        if buf == b"\r\n" || buf == b"\n" {
            buf.clear();
            continue;
        }

        if buf.ends_with(b"\r\n\r\n") {
            return Ok(Some(buf));
        }
    }
}
