//! Listener lifecycle: bind everything, run everything, first terminal
//! result wins.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use dhcp::{LeaseRegistry, Subnet};
use menu::MenuEngine;
use pxe::{AddressMode, DhcpResponder, PxeResponder};
use tftp::TftpEndpoint;

use crate::handler::{IpxeBootHandler, LogObserver};

pub const PORT_DHCP: u16 = 67;
pub const PORT_TFTP: u16 = 69;
pub const PORT_HTTP: u16 = 8080;
pub const PORT_PXE: u16 = 4011;

const LEASE_TIME: Duration = Duration::from_secs(3600);

/// Who hands out addresses on this segment.
#[derive(Debug, Clone)]
pub enum Addressing {
    /// An existing DHCP server does; we only chip in boot options.
    Proxy,
    /// Nobody else does; we lease out of this subnet.
    Standalone { subnet: Subnet },
}

pub struct OrchestratorConfig {
    pub root: PathBuf,
    pub server_ip: Ipv4Addr,
    pub addressing: Addressing,
    pub dhcp_port: u16,
    pub tftp_port: u16,
    pub http_port: u16,
    pub pxe_port: u16,
}

impl OrchestratorConfig {
    pub fn new(root: PathBuf, server_ip: Ipv4Addr, addressing: Addressing) -> Self {
        OrchestratorConfig {
            root,
            server_ip,
            addressing,
            dhcp_port: PORT_DHCP,
            tftp_port: PORT_TFTP,
            http_port: PORT_HTTP,
            pxe_port: PORT_PXE,
        }
    }
}

/// Requests a clean shutdown. Cheap to clone, safe to call more than once.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<anyhow::Result<()>>,
}

impl ShutdownHandle {
    /// Non-blocking: the first terminal value in the channel wins, so a full
    /// channel means the orchestrator is already coming down.
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(Ok(()));
    }
}

/// All four endpoints, bound but not yet serving.
pub struct Orchestrator {
    tftp: TftpEndpoint,
    pxe: PxeResponder,
    dhcp: DhcpResponder,
    http_listener: TcpListener,
    http_app: Router,
    results_tx: mpsc::Sender<anyhow::Result<()>>,
    results_rx: mpsc::Receiver<anyhow::Result<()>>,
}

impl Orchestrator {
    /// Bind every listener up front; a single failure aborts startup and
    /// drops whatever was already open.
    pub async fn bind(config: OrchestratorConfig) -> anyhow::Result<(Self, ShutdownHandle)> {
        let engine = Arc::new(
            MenuEngine::new(config.server_ip, config.http_port)
                .context("compiling the boot menu template")?,
        );

        let tftp = TftpEndpoint::bind(
            config.tftp_port,
            Arc::new(IpxeBootHandler::new(Arc::clone(&engine))),
            Arc::new(LogObserver),
        )
        .await?;

        let pxe = PxeResponder::bind(config.server_ip, config.pxe_port).await?;

        let mode = match &config.addressing {
            Addressing::Proxy => AddressMode::Proxy,
            Addressing::Standalone { subnet } => AddressMode::Standalone {
                registry: Arc::new(LeaseRegistry::new(*subnet, config.server_ip, LEASE_TIME)),
            },
        };
        let dhcp = DhcpResponder::bind(config.server_ip, config.dhcp_port, mode).await?;

        let http_listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.http_port))
                .await
                .with_context(|| format!("binding HTTP port {}", config.http_port))?;
        info!(addr = %http_listener.local_addr()?, "HTTP endpoint listening");

        let assets = ServeDir::new(config.root.join("assets"));
        let downstream = Router::new()
            .fallback_service(assets)
            .layer(TraceLayer::new_for_http());
        let http_app = menu::router(engine, downstream);

        // One slot per task plus one for the shutdown handle.
        let (results_tx, results_rx) = mpsc::channel(5);
        let handle = ShutdownHandle {
            tx: results_tx.clone(),
        };

        Ok((
            Orchestrator {
                tftp,
                pxe,
                dhcp,
                http_listener,
                http_app,
                results_tx,
                results_rx,
            },
            handle,
        ))
    }

    pub fn tftp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tftp.local_addr()
    }

    pub fn pxe_addr(&self) -> anyhow::Result<SocketAddr> {
        self.pxe.local_addr()
    }

    pub fn dhcp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.dhcp.local_addr()
    }

    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    /// Run until one endpoint dies or shutdown is requested; either way all
    /// endpoints are gone when this returns.
    pub async fn serve(mut self) -> anyhow::Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(4);

        let tftp = self.tftp;
        tasks.push(spawn_endpoint(&self.results_tx, "tftp", async move {
            tftp.serve().await
        }));

        let pxe = self.pxe;
        tasks.push(spawn_endpoint(&self.results_tx, "pxe", async move {
            pxe.serve().await
        }));

        let dhcp = self.dhcp;
        tasks.push(spawn_endpoint(&self.results_tx, "dhcp", async move {
            dhcp.serve().await
        }));

        let listener = self.http_listener;
        let app = self.http_app;
        tasks.push(spawn_endpoint(&self.results_tx, "http", async move {
            axum::serve(listener, app)
                .await
                .context("HTTP server shut down")
        }));

        // First terminal value wins: a requested shutdown or a dead endpoint.
        let result = self
            .results_rx
            .recv()
            .await
            .context("all endpoint tasks vanished")?;

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
        result
    }
}

fn spawn_endpoint(
    results: &mpsc::Sender<anyhow::Result<()>>,
    name: &'static str,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> JoinHandle<()> {
    let results = results.clone();
    tokio::spawn(async move {
        let result = fut.await.with_context(|| format!("{name} endpoint failed"));
        let _ = results.try_send(result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_config(root: PathBuf) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(
            root,
            Ipv4Addr::new(127, 0, 0, 1),
            Addressing::Proxy,
        );
        config.dhcp_port = 0;
        config.tftp_port = 0;
        config.http_port = 0;
        config.pxe_port = 0;
        config
    }

    #[tokio::test]
    async fn endpoint_failure_tears_everything_down() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, handle) = Orchestrator::bind(ephemeral_config(root.path().to_path_buf()))
            .await
            .unwrap();

        // A dying endpoint pushes its terminal error into the results
        // channel exactly like this.
        orchestrator
            .results_tx
            .try_send(Err(anyhow::anyhow!("tftp endpoint failed")))
            .unwrap();

        let err = orchestrator.serve().await.unwrap_err();
        assert!(err.to_string().contains("tftp endpoint failed"));

        // The orchestrator is already gone; a late shutdown has nothing
        // left to affect.
        handle.shutdown();
    }
}
