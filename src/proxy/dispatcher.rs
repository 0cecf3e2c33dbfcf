//! Dual dispatch
//!
//! Every inbound request is sent to two backends. The shadow copy runs on a
//! detached task whose outcome only ever reaches the logs; the primary copy
//! runs on the caller's task and its response is relayed back.
//!
//! Each path has its own panic boundary. A panicking shadow task is logged
//! and forgotten. A panic on the primary path turns into a generic 500 for
//! that one request.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, Config};
use crate::error::{ConfigError, RelayError};
use crate::http::request::{ForwardRequest, InboundRequest};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::duplicator::{Duplicate, duplicate};
use crate::proxy::relay::{RelayOutcome, relay};
use crate::proxy::upstream::BackendClient;

pub struct DualDispatcher {
    primary: BackendClient,
    shadow: BackendClient,
}

impl DualDispatcher {
    pub fn new(primary: BackendConfig, shadow: BackendConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            primary: BackendClient::new(primary)?,
            shadow: BackendClient::new(shadow)?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(config.primary.clone(), config.shadow.clone())
    }

    /// Duplicate `inbound`, fire the shadow copy, and answer `caller` with
    /// the primary's response.
    ///
    /// Primary backend failures are answered with a 500 and reported as a
    /// successful outcome; the only error returned is a failure to write to
    /// the caller.
    pub async fn handle<B, W>(
        &self,
        inbound: InboundRequest<B>,
        caller: &mut W,
    ) -> Result<RelayOutcome, RelayError>
    where
        B: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let peer = inbound.remote_addr;
        let method = inbound.head.method.clone();
        let path = inbound.head.path.clone();
        let version = inbound.head.version.clone();
        let caller_keep_alive = inbound.head.keep_alive();

        let Duplicate {
            primary,
            shadow,
            body_error,
        } = duplicate(inbound, self.primary.config(), self.shadow.config()).await;

        // The caller stream position is unknown after a failed body read.
        let keep_alive = caller_keep_alive && body_error.is_none();
        if let Some(e) = &body_error {
            warn!(
                peer = ?peer,
                method = %method,
                path = %path,
                error = %e,
                "Inbound body incomplete, forwarding captured bytes"
            );
        }

        self.spawn_shadow(shadow, peer);

        let response = match AssertUnwindSafe(self.primary.send(primary))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(
                    backend = self.primary.host(),
                    method = %method,
                    path = %path,
                    error = %e,
                    "Failed to receive from primary"
                );
                return respond_internal_error(caller, keep_alive).await;
            }
            Err(panic) => {
                error!(
                    peer = ?peer,
                    panic = %panic_message(&*panic),
                    "Panic while dispatching to primary"
                );
                return respond_internal_error(caller, keep_alive).await;
            }
        };

        let status = response.status();
        match AssertUnwindSafe(relay(response, caller, &version, keep_alive))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => {
                info!(
                    backend = self.primary.host(),
                    status = outcome.status.as_u16(),
                    method = %method,
                    path = %path,
                    bytes = outcome.body_bytes,
                    "Request relayed"
                );
                Ok(outcome)
            }
            Ok(Err(e)) => {
                warn!(
                    backend = self.primary.host(),
                    status = status.as_u16(),
                    method = %method,
                    path = %path,
                    error = %e,
                    "Failed to relay primary response"
                );
                Err(e)
            }
            Err(panic) => {
                error!(
                    peer = ?peer,
                    panic = %panic_message(&*panic),
                    "Panic while relaying primary response"
                );
                Err(RelayError::RelayWrite(std::io::Error::other(
                    "relay aborted by panic",
                )))
            }
        }
    }

    /// Send the shadow copy on its own task. The handle is only useful for
    /// tests; production code lets the task run detached.
    pub fn spawn_shadow(&self, request: ForwardRequest, peer: Option<SocketAddr>) -> JoinHandle<()> {
        let client = self.shadow.clone();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(dispatch_shadow(&client, request))
                .catch_unwind()
                .await
            {
                error!(
                    peer = ?peer,
                    panic = %panic_message(&*panic),
                    "Panic while dispatching to shadow"
                );
            }
        })
    }
}

/// Send to the shadow, drain whatever comes back, and keep only a log line.
async fn dispatch_shadow(client: &BackendClient, request: ForwardRequest) {
    let method = request.method.clone();
    let path = request.path.clone();

    let mut response = match client.send(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                shadow = client.host(),
                method = %method,
                path = %path,
                error = %e,
                "Failed to receive from shadow"
            );
            return;
        }
    };

    let status = response.status();
    let drained = response.drain().await;
    response.release().await;

    match drained {
        Ok(bytes) => debug!(
            shadow = client.host(),
            status = status.as_u16(),
            method = %method,
            path = %path,
            bytes,
            "Shadow response discarded"
        ),
        Err(e) => warn!(
            shadow = client.host(),
            status = status.as_u16(),
            error = %e,
            "Failed to drain shadow response"
        ),
    }
}

async fn respond_internal_error<W>(caller: &mut W, keep_alive: bool) -> Result<RelayOutcome, RelayError>
where
    W: AsyncWrite + Unpin,
{
    let mut response = Response::internal_error();
    if !keep_alive {
        response
            .headers
            .insert("Connection".to_string(), "close".to_string());
    }

    ResponseWriter::new(&response)
        .write_to_stream(caller)
        .await
        .map_err(RelayError::RelayWrite)?;

    Ok(RelayOutcome {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body_bytes: 0,
        keep_alive,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
