//! The boot orchestrator: one process answering DHCP, PXE boot-service
//! discovery, TFTP and HTTP for machines netbooting on its segment.

pub mod bootstrap;
pub mod handler;
pub mod orchestrator;

pub use orchestrator::{Addressing, Orchestrator, OrchestratorConfig, ShutdownHandle};
