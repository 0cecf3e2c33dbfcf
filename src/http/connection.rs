use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::http::body::{Body, Framing};
use crate::http::parser::{parse_http_request, read_head};
use crate::http::request::{InboundRequest, RequestHead};
use crate::http::response::Response;
use crate::http::writer::{CONTINUE, ResponseWriter};
use crate::proxy::DualDispatcher;

/// How long a caller may take to send a request head when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One caller connection, plain or TLS.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    dispatcher: Arc<DualDispatcher>,
    idle_timeout: Duration,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Processing(RequestHead),
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, peer: SocketAddr, dispatcher: Arc<DualDispatcher>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            peer,
            dispatcher,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            state: ConnectionState::Reading,
        }
    }

    /// Bounds the wait for each request head, including idle keep-alive time.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    let limit = self.idle_timeout;
                    self.state = match timeout(limit, self.read_request()).await {
                        Ok(Ok(Some(head))) => ConnectionState::Processing(head),
                        Ok(Ok(None)) => ConnectionState::Closed,
                        Ok(Err(e)) => return Err(e),
                        Err(_) => {
                            debug!(peer = %self.peer, ?limit, "Idle timeout waiting for request");
                            ConnectionState::Closed
                        }
                    };
                }

                ConnectionState::Processing(head) => {
                    self.state = if self.process(head).await? {
                        ConnectionState::Reading // go back for next request
                    } else {
                        ConnectionState::Closed
                    };
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        let _ = self.writer.shutdown().await;
        Ok(())
    }

    /// Reads the next request head. `None` means the connection is done.
    pub async fn read_request(&mut self) -> anyhow::Result<Option<RequestHead>> {
        let Some(bytes) = read_head(&mut self.reader).await? else {
            // Client closed connection
            return Ok(None);
        };

        match parse_http_request(&bytes) {
            Ok((head, _)) => Ok(Some(head)),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Malformed request");
                self.reject().await?;
                Ok(None)
            }
        }
    }

    /// Hands one request to the dispatcher. Returns whether to keep the
    /// connection open.
    async fn process(&mut self, head: RequestHead) -> anyhow::Result<bool> {
        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Unreadable request body framing");
                self.reject().await?;
                return Ok(false);
            }
        };

        if head.expects_continue() && framing != Framing::Empty {
            self.writer.write_all(CONTINUE).await?;
            self.writer.flush().await?;
        }

        debug!(
            peer = %self.peer,
            method = %head.method,
            path = %head.path,
            "Request received"
        );

        let inbound =
            InboundRequest::new(head, Body::new(&mut self.reader, framing)).with_remote_addr(self.peer);

        match self.dispatcher.handle(inbound, &mut self.writer).await {
            Ok(outcome) => Ok(outcome.keep_alive),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Closing connection after relay failure");
                Ok(false)
            }
        }
    }

    async fn reject(&mut self) -> anyhow::Result<()> {
        ResponseWriter::new(&Response::bad_request())
            .write_to_stream(&mut self.writer)
            .await?;
        Ok(())
    }
}
