//! Read-only async TFTP server with option negotiation.
//!
//! The endpoint owns the well-known request port; each accepted read runs on
//! its own ephemeral socket. What gets served is entirely up to the
//! [`ReadHandler`] the caller plugs in.

pub mod endpoint;
pub mod protocol;
pub mod transfer;

pub use endpoint::{NullObserver, ReadError, ReadHandler, TftpEndpoint, TransferObserver};
pub use transfer::TransferError;
