//! HTTP/1.x protocol plumbing.
//!
//! Just enough HTTP to sit in the middle of a conversation: parse heads,
//! decode bodies, and serialize responses back onto the wire.
//!
//! # Architecture
//!
//! - **`connection`**: The frontend connection handler implementing the request-response state machine
//! - **`parser`**: Reads and parses request and response heads
//! - **`body`**: Single-use body streams (length, chunked, until-EOF framing)
//! - **`request`**: Inbound and forward request representations
//! - **`response`**: Status codes, response heads and locally generated responses
//! - **`writer`**: Serializes responses for the caller
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for the next request head
//!        └──────┬──────┘
//!               │ Head received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Duplicate, dispatch, relay primary response
//!        └──────┬───────────┘
//!               │ Response relayed
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

use std::collections::HashMap;

pub mod body;
pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

/// Looks up a header ignoring ASCII case.
pub fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Checks a comma-separated header value for a token, ignoring ASCII case.
pub fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
