//! PXE boot-service discovery and DHCP responders.
//!
//! Two UDP endpoints share one reply-building core: the boot-service
//! responder on port 4011 answers unicast PXE discovery, and the DHCP
//! responder on port 67 either augments an existing DHCP server's answers
//! (proxy mode) or runs the full address exchange itself (standalone mode).

pub mod classify;
pub mod responder;
pub mod types;

pub use classify::{classify, ClassifyError};
pub use responder::{AddressMode, DhcpResponder, PxeResponder};
pub use types::{Architecture, Firmware, Machine};

/// The vendor class our chainloaded iPXE reports back with.
pub const OWN_CLASS_ID: &str = "PXEClient:Arch:00000:UNDI:002001";

/// The user-class rendering our chainloaded iPXE reports back with.
pub const OWN_CLASS_INFO: &str = "[iPXE]";
