//! The TFTP read endpoint: RRQ dispatch in front of a pluggable handler.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::protocol::{self, ErrorCode, ReadRequest, OP_RRQ, OP_WRQ};
use crate::transfer::{negotiate, run_transfer, TransferError};

/// What a read request resolves to.
///
/// `UnknownPath` and `UnknownClass` both surface as file-not-found on the
/// wire; they are distinct so logs say which stage rejected the client.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no file at {0:?}")]
    UnknownPath(String),
    #[error("unrecognized boot class {0:?}")]
    UnknownClass(String),
    #[error("failed to produce {0:?}")]
    Failed(String, #[source] anyhow::Error),
}

/// Resolves a requested path to the bytes to serve.
#[async_trait::async_trait]
pub trait ReadHandler: Send + Sync {
    async fn open(&self, path: &str) -> Result<Bytes, ReadError>;
}

/// Observes transfer outcomes. Observation only; the transfer result does
/// not depend on it.
pub trait TransferObserver: Send + Sync {
    fn on_success(&self, path: &str, peer: SocketAddr);
    fn on_failure(&self, path: &str, peer: SocketAddr, error: &TransferError);
}

/// An observer that does nothing.
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_success(&self, _path: &str, _peer: SocketAddr) {}
    fn on_failure(&self, _path: &str, _peer: SocketAddr, _error: &TransferError) {}
}

pub struct TftpEndpoint {
    socket: UdpSocket,
    handler: Arc<dyn ReadHandler>,
    observer: Arc<dyn TransferObserver>,
}

impl TftpEndpoint {
    pub async fn bind(
        port: u16,
        handler: Arc<dyn ReadHandler>,
        observer: Arc<dyn TransferObserver>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("binding TFTP port {port}"))?;
        info!(addr = %socket.local_addr()?, "TFTP endpoint listening");
        Ok(TftpEndpoint {
            socket,
            handler,
            observer,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("receiving on TFTP socket")?;
            if len < 2 {
                continue;
            }
            match u16::from_be_bytes([buf[0], buf[1]]) {
                OP_RRQ => self.dispatch_rrq(&buf[..len], peer).await,
                OP_WRQ => {
                    let error =
                        protocol::build_error(ErrorCode::AccessViolation, "read-only server");
                    let _ = self.socket.send_to(&error, peer).await;
                }
                op => {
                    debug!(%peer, op, "unexpected opcode on request port");
                    let error =
                        protocol::build_error(ErrorCode::IllegalOperation, "expected RRQ");
                    let _ = self.socket.send_to(&error, peer).await;
                }
            }
        }
    }

    async fn dispatch_rrq(&self, packet: &[u8], peer: SocketAddr) {
        let request = match protocol::parse_rrq(packet) {
            Ok(request) => request,
            Err(err) => {
                debug!(%peer, %err, "malformed read request");
                let error = protocol::build_error(ErrorCode::IllegalOperation, &err.to_string());
                let _ = self.socket.send_to(&error, peer).await;
                return;
            }
        };

        let body = match self.handler.open(&request.filename).await {
            Ok(body) => body,
            Err(err) => {
                debug!(%peer, file = %request.filename, %err, "rejecting read request");
                let code = match err {
                    ReadError::UnknownPath(_) | ReadError::UnknownClass(_) => {
                        ErrorCode::FileNotFound
                    }
                    ReadError::Failed(..) => ErrorCode::NotDefined,
                };
                let error = protocol::build_error(code, &err.to_string());
                let _ = self.socket.send_to(&error, peer).await;
                return;
            }
        };

        let handler_observer = Arc::clone(&self.observer);
        tokio::spawn(async move {
            if let Err(err) = transfer_task(&request, peer, body, &*handler_observer).await {
                warn!(%peer, file = %request.filename, %err, "transfer failed");
            }
        });
    }
}

/// Run one transfer from its own ephemeral socket, reporting the outcome to
/// the observer.
async fn transfer_task(
    request: &ReadRequest,
    peer: SocketAddr,
    body: Bytes,
    observer: &dyn TransferObserver,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("binding transfer socket")?;
    let negotiated = negotiate(&request.options, body.len());
    match run_transfer(&socket, peer, body, &negotiated).await {
        Ok(()) => {
            observer.on_success(&request.filename, peer);
            Ok(())
        }
        Err(err) => {
            observer.on_failure(&request.filename, peer, &err);
            Err(err.into())
        }
    }
}
