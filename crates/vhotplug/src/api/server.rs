//! API server: binds every enabled transport (TCP, VSOCK, UNIX) and spawns a
//! connection handler per accepted client.

use std::sync::Arc;

use common::{Metrics, RequestRateLimit, RequestRateLimiter};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_vsock::{VsockAddr, VsockListener};
use tracing::{error, info, warn};

use super::connection::handle_connection;
use crate::config::{ApiConfig, ApiTransport};
use crate::orchestrator::OrchestratorHandle;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("api transport {transport} requires configuration that was not provided")]
    MissingConfig { transport: &'static str },
    #[error("failed to bind {transport}: {source}")]
    Bind {
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Owns the listener tasks for every enabled transport. Dropping it does not
/// stop the listeners; callers hold the `JoinHandle`s returned by `spawn`.
pub struct ApiServer {
    config: ApiConfig,
    orchestrator: OrchestratorHandle,
    metrics: Arc<Metrics>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, orchestrator: OrchestratorHandle, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            orchestrator,
            metrics,
        }
    }

    /// Spawns one listener task per enabled transport and returns their
    /// join handles. Each listener accepts indefinitely; a fatal bind error
    /// on one transport does not prevent the others from starting.
    pub async fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for transport in &self.config.transports {
            match transport {
                ApiTransport::Tcp => match self.spawn_tcp().await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => error!(error = %e, "failed to start tcp api listener"),
                },
                ApiTransport::Unix => match self.spawn_unix().await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => error!(error = %e, "failed to start unix api listener"),
                },
                ApiTransport::Vsock => match self.spawn_vsock().await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => error!(error = %e, "failed to start vsock api listener"),
                },
            }
        }
        handles
    }

    async fn spawn_tcp(&self) -> Result<tokio::task::JoinHandle<()>, ApiServerError> {
        let host = self.config.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        let port = self.config.port.ok_or(ApiServerError::MissingConfig { transport: "tcp" })?;
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ApiServerError::Bind { transport: "tcp", source })?;
        info!(%addr, "api tcp listener bound");

        let orchestrator = self.orchestrator.clone();
        let metrics = self.metrics.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let orchestrator = orchestrator.clone();
                        let metrics = metrics.clone();
                        let limiter = Arc::new(RequestRateLimiter::new(RequestRateLimit::new(50.0, Some(100.0))));
                        tokio::spawn(handle_connection(stream, peer.to_string(), orchestrator, limiter, metrics));
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                    }
                }
            }
        }))
    }

    async fn spawn_unix(&self) -> Result<tokio::task::JoinHandle<()>, ApiServerError> {
        let path = self
            .config
            .unix_socket
            .clone()
            .ok_or(ApiServerError::MissingConfig { transport: "unix" })?;
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|source| ApiServerError::Bind { transport: "unix", source })?;
        info!(path = %path.display(), "api unix listener bound");

        let orchestrator = self.orchestrator.clone();
        let metrics = self.metrics.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let orchestrator = orchestrator.clone();
                        let metrics = metrics.clone();
                        let limiter = Arc::new(RequestRateLimiter::new(RequestRateLimit::new(50.0, Some(100.0))));
                        tokio::spawn(handle_connection(stream, "unix".to_string(), orchestrator, limiter, metrics));
                    }
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                    }
                }
            }
        }))
    }

    async fn spawn_vsock(&self) -> Result<tokio::task::JoinHandle<()>, ApiServerError> {
        let port = self.config.port.ok_or(ApiServerError::MissingConfig { transport: "vsock" })?;
        let mut listener = VsockListener::bind(VsockAddr::new(libc_vsock_any_cid(), port as u32))
            .map_err(|source| ApiServerError::Bind { transport: "vsock", source })?;
        info!(port, "api vsock listener bound");

        let allowed_cids = self.config.allowed_cids.clone();
        let orchestrator = self.orchestrator.clone();
        let metrics = self.metrics.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if !allowed_cids.is_empty() && !allowed_cids.contains(&addr.cid()) {
                            warn!(cid = addr.cid(), "vsock peer rejected by allowedCids filter");
                            continue;
                        }
                        let orchestrator = orchestrator.clone();
                        let metrics = metrics.clone();
                        let limiter = Arc::new(RequestRateLimiter::new(RequestRateLimit::new(50.0, Some(100.0))));
                        tokio::spawn(handle_connection(stream, format!("vsock:{}", addr.cid()), orchestrator, limiter, metrics));
                    }
                    Err(e) => {
                        warn!(error = %e, "vsock accept failed");
                    }
                }
            }
        }))
    }
}

/// `VMADDR_CID_ANY`: accept connections from any CID; `allowedCids` narrows
/// this after accept.
fn libc_vsock_any_cid() -> u32 {
    0xFFFFFFFF
}
