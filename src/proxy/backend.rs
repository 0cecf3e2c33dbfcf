//! Backend responses
//!
//! A [`BackendResponse`] owns the connection it was read from. The body is
//! streamed off that connection on demand and the connection is closed by
//! [`BackendResponse::release`], which consumes the response so it can only
//! happen once.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::error::{RelayError, timed_out};
use crate::http::body::{Body, Framing};
use crate::http::response::{ResponseHead, StatusCode};
use crate::proxy::upstream::{BackendConn, close_connection};

pub struct BackendResponse {
    /// Status line and headers as received
    pub head: ResponseHead,
    body: Body<BackendConn>,
    host: String,
    timeout: Duration,
}

impl BackendResponse {
    pub(crate) fn new(
        host: String,
        head: ResponseHead,
        body: Body<BackendConn>,
        timeout: Duration,
    ) -> Self {
        Self {
            head,
            body,
            host,
            timeout,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The backend this response came from.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn framing(&self) -> Framing {
        self.body.framing()
    }

    /// Read the next piece of the body, bounded by the backend timeout.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
        timeout(self.timeout, self.body.next_chunk())
            .await
            .map_err(|_| timed_out("response body read", self.timeout))
            .and_then(|read| read)
            .map_err(|source| RelayError::Read {
                host: self.host.clone(),
                source,
            })
    }

    /// Read and discard the rest of the body.
    pub async fn drain(&mut self) -> Result<u64, RelayError> {
        let mut total = 0;
        while let Some(chunk) = self.next_chunk().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Close the backend connection.
    pub async fn release(self) {
        let conn = self.body.into_inner();
        close_connection(conn.into_inner(), self.timeout).await;
        tracing::trace!(backend = %self.host, "Backend connection closed");
    }
}

impl fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendResponse")
            .field("host", &self.host)
            .field("head", &self.head)
            .field("framing", &self.body.framing())
            .finish_non_exhaustive()
    }
}
