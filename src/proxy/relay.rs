//! Response relay
//!
//! Copies a backend response onto the caller's connection: status, headers
//! and body bytes exactly as received. The backend connection is released
//! whatever happens.

use std::collections::HashMap;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;
use crate::http::body::Framing;
use crate::http::response::StatusCode;
use crate::http::writer::{LAST_CHUNK, ResponseWriter, encode_chunk, serialize_head};
use crate::proxy::backend::BackendResponse;

/// What was sent to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub status: StatusCode,
    /// Payload bytes written, excluding head and chunk framing.
    pub body_bytes: u64,
    /// False when the caller connection has to be closed after this response.
    pub keep_alive: bool,
}

/// Relay `response` to `caller`, then release the backend connection.
///
/// `caller_version` is the HTTP version of the inbound request. HTTP/1.0
/// callers cannot receive chunked bodies, so those are sent unframed and
/// delimited by closing the connection. `caller_keep_alive` is false when the
/// caller connection is going to be closed regardless of the response.
///
/// Whenever the outcome is not keep-alive the relayed head carries
/// `Connection: close`.
pub async fn relay<W>(
    mut response: BackendResponse,
    caller: &mut W,
    caller_version: &str,
    caller_keep_alive: bool,
) -> Result<RelayOutcome, RelayError>
where
    W: AsyncWrite + Unpin,
{
    let result = copy_response(&mut response, caller, caller_version, caller_keep_alive).await;
    response.release().await;
    result
}

async fn copy_response<W>(
    response: &mut BackendResponse,
    caller: &mut W,
    caller_version: &str,
    caller_keep_alive: bool,
) -> Result<RelayOutcome, RelayError>
where
    W: AsyncWrite + Unpin,
{
    let framing = response.framing();
    let legacy_caller = caller_version == "HTTP/1.0";
    let rechunk = framing == Framing::Chunked && !legacy_caller;
    let close_delimited = framing == Framing::UntilEof || (framing == Framing::Chunked && legacy_caller);

    let status = response.status();
    let mut headers = response.head.headers.clone();
    if framing == Framing::Chunked && legacy_caller {
        headers.retain(|k, _| !k.eq_ignore_ascii_case("Transfer-Encoding"));
    }
    let keep_alive = caller_keep_alive && !close_delimited && !response.head.wants_close();
    if !keep_alive {
        set_connection(&mut headers, "close");
    } else if legacy_caller {
        set_connection(&mut headers, "keep-alive");
    }

    let head = serialize_head(status, &response.head.reason, &headers);
    ResponseWriter::from_bytes(head)
        .write_to_stream(caller)
        .await
        .map_err(RelayError::RelayWrite)?;

    let mut body_bytes = 0;
    while let Some(chunk) = response.next_chunk().await? {
        body_bytes += chunk.len() as u64;
        let written = if rechunk {
            caller.write_all(&encode_chunk(&chunk)).await
        } else {
            caller.write_all(&chunk).await
        };
        written.map_err(RelayError::RelayWrite)?;
    }

    if rechunk {
        caller
            .write_all(LAST_CHUNK)
            .await
            .map_err(RelayError::RelayWrite)?;
    }
    caller.flush().await.map_err(RelayError::RelayWrite)?;

    Ok(RelayOutcome {
        status,
        body_bytes,
        keep_alive,
    })
}

/// Replaces any `Connection` header with a single one carrying `value`.
fn set_connection(headers: &mut HashMap<String, String>, value: &str) {
    headers.retain(|k, _| !k.eq_ignore_ascii_case("Connection"));
    headers.insert("Connection".to_string(), value.to_string());
}
