//! Upstream connections and request forwarding
//!
//! A [`BackendClient`] opens a fresh connection per request, writes one
//! forward request with `Connection: close`, and reads back one response
//! head. Connections are never pooled or reused.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::BackendConfig;
use crate::error::{ConfigError, RelayError, timed_out};
use crate::http::body::{Body, Framing};
use crate::http::parser::{parse_http_response, read_head};
use crate::http::request::{ForwardRequest, Method};
use crate::http::response::{ResponseHead, StatusCode};
use crate::proxy::backend::BackendResponse;
use crate::tls;

/// Headers the client replaces with its own framing.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "Expect",
    "Content-Length",
    "Host",
];

/// Any stream a backend conversation can run over.
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

/// A buffered backend connection, plain or TLS.
pub type BackendConn = BufReader<Box<dyn BackendIo>>;

#[derive(Clone)]
struct BackendTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Sends forward requests to one backend.
///
/// Cheap to clone; clones share the read-only configuration and TLS setup.
#[derive(Clone)]
pub struct BackendClient {
    config: Arc<BackendConfig>,
    connect_host: String,
    port: u16,
    tls: Option<BackendTls>,
}

impl BackendClient {
    /// Create a client for the given backend, preparing TLS if it is enabled
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let (connect_host, port) = config.authority()?;

        let tls = if config.use_tls {
            Some(BackendTls {
                connector: tls::client_connector(&config)?,
                server_name: tls::server_name(&config)?,
            })
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            connect_host,
            port,
            tls,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The configured `host:port`, used to tag log lines.
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Send one request and read the response head.
    ///
    /// On success the connection moves into the returned [`BackendResponse`],
    /// which must be released by whoever consumes it. On failure the
    /// connection has already been closed.
    pub async fn send(&self, request: ForwardRequest) -> Result<BackendResponse, RelayError> {
        let limit = self.config.timeout;
        let stream = self.connect().await?;
        let mut conn: BackendConn = BufReader::new(stream);

        tracing::trace!(backend = self.host(), "Connected to backend");

        let request_bytes = build_http_request(&request);
        if let Err(source) = write_request(&mut conn, &request_bytes, limit).await {
            close_connection(conn.into_inner(), limit).await;
            return Err(RelayError::Write {
                host: self.config.host.clone(),
                source,
            });
        }

        tracing::trace!(backend = self.host(), bytes = request_bytes.len(), "Request sent to backend");

        let head_request = request.method == Method::HEAD;
        match read_response_head(&mut conn, limit, head_request).await {
            Ok((head, framing)) => Ok(BackendResponse::new(
                self.config.host.clone(),
                head,
                Body::new(conn, framing),
                limit,
            )),
            Err(source) => {
                close_connection(conn.into_inner(), limit).await;
                Err(RelayError::Read {
                    host: self.config.host.clone(),
                    source,
                })
            }
        }
    }

    async fn connect(&self) -> Result<Box<dyn BackendIo>, RelayError> {
        let limit = self.config.timeout;
        let host = &self.config.host;

        let tcp = timeout(limit, TcpStream::connect((self.connect_host.as_str(), self.port)))
            .await
            .map_err(|_| RelayError::Dial {
                host: host.clone(),
                source: timed_out("connect", limit),
            })?
            .map_err(|source| RelayError::Dial {
                host: host.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let Some(tls) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        // A failed or abandoned handshake drops the TCP stream with it.
        match timeout(limit, tls.connector.connect(tls.server_name.clone(), tcp)).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(source)) => Err(RelayError::TlsHandshake {
                host: host.clone(),
                source,
            }),
            Err(_) => Err(RelayError::TlsHandshake {
                host: host.clone(),
                source: timed_out("TLS handshake", limit),
            }),
        }
    }
}

/// Build HTTP request bytes to send to a backend
///
/// Method, target, version, end-to-end headers and body are copied as-is.
/// `Host` comes from [`ForwardRequest::host`], the body is framed with
/// `Content-Length`, and `Connection: close` is always sent.
pub fn build_http_request(request: &ForwardRequest) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512 + request.body.len());

    // Request line
    let path = if request.path.is_empty() {
        "/"
    } else {
        &request.path
    };
    buffer.extend_from_slice(
        format!("{} {} {}\r\n", request.method, path, request.version).as_bytes(),
    );

    buffer.extend_from_slice(format!("Host: {}\r\n", request.host).as_bytes());

    for (key, value) in &request.headers {
        if HOP_BY_HOP.iter().any(|h| key.eq_ignore_ascii_case(h)) {
            continue;
        }
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    let declared_body = request.header("Content-Length").is_some()
        || request.header("Transfer-Encoding").is_some();
    if declared_body || !request.body.is_empty() {
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }

    if request.close {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }

    // End of headers
    buffer.extend_from_slice(b"\r\n");

    buffer.extend_from_slice(&request.body);

    buffer
}

async fn write_request(
    conn: &mut BackendConn,
    bytes: &[u8],
    limit: Duration,
) -> std::io::Result<()> {
    timeout(limit, async {
        conn.write_all(bytes).await?;
        conn.flush().await
    })
    .await
    .map_err(|_| timed_out("request write", limit))?
}

/// Read the final response head, skipping interim 1xx responses.
///
/// One deadline covers the interim responses and the final head together.
async fn read_response_head(
    conn: &mut BackendConn,
    limit: Duration,
    head_request: bool,
) -> std::io::Result<(ResponseHead, Framing)> {
    timeout(limit, async {
        loop {
            let bytes = read_head(&mut *conn).await?.ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before a response was received",
                )
            })?;

            let (head, _) = parse_http_response(&bytes)?;

            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                tracing::trace!(status = head.status.as_u16(), "Skipping interim response");
                continue;
            }

            let framing = head.body_framing(head_request)?;
            return Ok::<_, std::io::Error>((head, framing));
        }
    })
    .await
    .map_err(|_| timed_out("response read", limit))?
}

/// Shut a backend connection down and drop it.
pub(crate) async fn close_connection(mut io: Box<dyn BackendIo>, limit: Duration) {
    let _ = timeout(limit, io.shutdown()).await;
}
