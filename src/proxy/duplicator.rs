//! Request duplication
//!
//! The inbound body can be read only once, so it is copied up front into two
//! independent buffers in a single pass. Each forward request owns one of
//! them.

use bytes::BytesMut;
use tokio::io::AsyncBufRead;

use crate::config::BackendConfig;
use crate::error::RelayError;
use crate::http::request::{ForwardRequest, InboundRequest, RequestHead};

/// Cap on the up-front buffer reservation taken from `Content-Length`.
const MAX_PREALLOC: u64 = 1024 * 1024;

/// The two copies of one inbound request.
#[derive(Debug)]
pub struct Duplicate {
    pub primary: ForwardRequest,
    pub shadow: ForwardRequest,
    /// Set when the inbound body could not be read to the end. Both copies
    /// still hold every byte captured before the failure.
    pub body_error: Option<RelayError>,
}

/// Consume the inbound request and split it into a primary and a shadow copy.
pub async fn duplicate<B>(
    inbound: InboundRequest<B>,
    primary: &BackendConfig,
    shadow: &BackendConfig,
) -> Duplicate
where
    B: AsyncBufRead + Unpin,
{
    let capacity = inbound.content_length().unwrap_or(0).min(MAX_PREALLOC) as usize;
    let InboundRequest { head, mut body, .. } = inbound;

    let mut primary_body = BytesMut::with_capacity(capacity);
    let mut shadow_body = BytesMut::with_capacity(capacity);
    let mut body_error = None;

    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                primary_body.extend_from_slice(&chunk);
                shadow_body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                body_error = Some(RelayError::BodyRead(e));
                break;
            }
        }
    }
    drop(body);

    Duplicate {
        primary: forward_request(&head, primary_body, primary),
        shadow: forward_request(&head, shadow_body, shadow),
        body_error,
    }
}

fn forward_request(head: &RequestHead, body: BytesMut, backend: &BackendConfig) -> ForwardRequest {
    let host = if backend.rewrite_host {
        backend.host.clone()
    } else {
        head.host().to_string()
    };

    ForwardRequest {
        method: head.method.clone(),
        path: head.path.clone(),
        version: head.version.clone(),
        headers: head.headers.clone(),
        host,
        body: body.freeze(),
        close: true,
    }
}
