//! TCP listener: accepts connections (optionally over TLS) and hands each
//! one to the hub on its own task.

use crate::hub::Hub;
use rtd_core::{RtdError, RtdResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The hub's network front.
pub struct RtdServer {
    hub: Arc<Hub>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl RtdServer {
    /// Bind the listener. Without a TLS config connections are plain `ws://`.
    pub async fn bind(
        addr: SocketAddr,
        hub: Arc<Hub>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> RtdResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RtdError::Transport(format!("bind {addr} failed: {e}")))?;
        Ok(Self {
            hub,
            listener,
            tls: tls.map(TlsAcceptor::from),
        })
    }

    pub fn local_addr(&self) -> RtdResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Accept connections until `shutdown` resolves, then stop every
    /// connection loop.
    pub async fn run<F>(self, shutdown: F) -> RtdResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %self.local_addr()?,
            tls = self.tls.is_some(),
            "rtd-server ready"
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "TCP connection accepted");
                        let hub = self.hub.clone();
                        let tls = self.tls.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_stream(hub, tls, stream, remote).await {
                                warn!(remote = %remote, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
            }
        }

        self.hub.shutdown();
        Ok(())
    }
}

async fn serve_stream(
    hub: Arc<Hub>,
    tls: Option<TlsAcceptor>,
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
) -> RtdResult<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| RtdError::Transport(format!("TLS accept failed: {e}")))?;
            hub.handle_connection(stream, Some(remote.ip())).await
        }
        None => hub.handle_connection(stream, Some(remote.ip())).await,
    }
}
