use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::Connection;
use crate::proxy::DualDispatcher;
use crate::tls;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the configured address and serves until the listener fails.
pub async fn run(cfg: &Config, dispatcher: Arc<DualDispatcher>) -> anyhow::Result<()> {
    let acceptor = cfg.tls.as_ref().map(tls::acceptor).transpose()?;

    let addr = cfg.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;

    info!(
        "Listening on {} ({}) and proxying to {} / {}",
        addr,
        if acceptor.is_some() { "https" } else { "http" },
        cfg.primary.host,
        cfg.shadow.host
    );

    serve(listener, acceptor, dispatcher, cfg.idle_timeout).await
}

/// Accepts connections forever, one task per connection.
///
/// `idle_timeout` bounds how long each connection waits for a request head.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dispatcher: Arc<DualDispatcher>,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("Accepted connection from {}", peer);
        let _ = socket.set_nodelay(true);

        let dispatcher = dispatcher.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                None => {
                    Connection::new(socket, peer, dispatcher)
                        .with_idle_timeout(idle_timeout)
                        .run()
                        .await
                }
                Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => {
                        Connection::new(stream, peer, dispatcher)
                            .with_idle_timeout(idle_timeout)
                            .run()
                            .await
                    }
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("TLS handshake failed")),
                    Err(_) => Err(anyhow::anyhow!("TLS handshake timed out")),
                },
            };

            if let Err(e) = result {
                debug!("Connection error from {}: {:#}", peer, e);
            }
        });
    }
}
