use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use tracing::info;

use bootherd::bootstrap::{self, BroadcastLeaseClient, IoctlLink};
use bootherd::{Orchestrator, OrchestratorConfig};

const BOOT_INTERFACE: &str = "eth0";

/// Network boot server: answers DHCP, PXE, TFTP and HTTP for netbooting
/// machines.
#[derive(FromArgs)]
struct CliArgs {
    /// server root, where to serve the files from
    #[argh(option, default = "PathBuf::from(\".\")")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: CliArgs = argh::from_env();

    let mac = bootstrap::interface_mac(BOOT_INTERFACE)
        .with_context(|| format!("reading hardware address of {BOOT_INTERFACE}"))?;
    let negotiator = BroadcastLeaseClient::new(BOOT_INTERFACE, mac);
    let plan = bootstrap::bootstrap(BOOT_INTERFACE, &IoctlLink, &negotiator)
        .await
        .context("network bootstrap")?;

    let config = OrchestratorConfig::new(args.root, plan.server_ip, plan.addressing);
    let (orchestrator, handle) = Orchestrator::bind(config).await?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    orchestrator.serve().await
}
