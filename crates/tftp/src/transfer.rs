//! In-memory block transfer engine.
//!
//! Each accepted read request gets an ephemeral socket and one call to
//! [`run_transfer`], which negotiates options, streams the body in blocks,
//! and retries unacknowledged blocks until the client answers or the retry
//! budget runs out.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::protocol::{build_data, build_oack, parse_ack};

/// Ethernet-safe payload ceiling; clients asking for more get clamped.
const MAX_BLOCK_SIZE: usize = 1400;
const DEFAULT_BLOCK_SIZE: usize = 512;
const ACK_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_RETRIES: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("client {peer} stopped acknowledging at block {block}")]
    Stalled { peer: SocketAddr, block: u16 },
    #[error("transfer socket error")]
    Io(#[from] std::io::Error),
}

/// Negotiated transfer parameters derived from the client's option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub block_size: usize,
    /// Options to echo back in an OACK, empty when the client sent none.
    pub reply_options: Vec<(String, String)>,
}

/// Apply RFC 2348/2349/7440 negotiation rules against a body of known size.
pub fn negotiate(options: &[(String, String)], body_len: usize) -> Negotiated {
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut reply_options = Vec::new();
    for (name, value) in options {
        match name.as_str() {
            "blksize" => {
                if let Ok(requested) = value.parse::<usize>() {
                    if requested >= 8 {
                        block_size = requested.min(MAX_BLOCK_SIZE);
                        reply_options.push(("blksize".to_string(), block_size.to_string()));
                    }
                }
            }
            // The body is fully in memory, so tsize is always exact.
            "tsize" => reply_options.push(("tsize".to_string(), body_len.to_string())),
            "timeout" => reply_options.push(("timeout".to_string(), value.clone())),
            // Windowed transfers are not worth it for a small script.
            "windowsize" => reply_options.push(("windowsize".to_string(), "1".to_string())),
            _ => {}
        }
    }
    Negotiated {
        block_size,
        reply_options,
    }
}

/// Drive one complete read transfer over `socket` to `peer`.
pub async fn run_transfer(
    socket: &UdpSocket,
    peer: SocketAddr,
    body: Bytes,
    negotiated: &Negotiated,
) -> Result<(), TransferError> {
    if !negotiated.reply_options.is_empty() {
        let oack = build_oack(&negotiated.reply_options);
        send_and_await_ack(socket, peer, &oack, 0).await?;
    }

    let block_size = negotiated.block_size;
    let mut block: u16 = 1;
    let mut offset = 0;
    loop {
        let end = (offset + block_size).min(body.len());
        let payload = &body[offset..end];
        let packet = build_data(block, payload);
        send_and_await_ack(socket, peer, &packet, block).await?;
        trace!(%peer, block, len = payload.len(), "block acknowledged");

        offset = end;
        if payload.len() < block_size {
            break;
        }
        if offset == body.len() {
            // Exact multiple: a trailing empty block marks the end.
            block = block.wrapping_add(1);
            let packet = build_data(block, &[]);
            send_and_await_ack(socket, peer, &packet, block).await?;
            break;
        }
        block = block.wrapping_add(1);
    }

    debug!(%peer, len = body.len(), "transfer complete");
    Ok(())
}

/// Send one packet and wait for the matching ACK, retrying on timeout.
/// Duplicate or stale ACKs are ignored rather than treated as progress.
async fn send_and_await_ack(
    socket: &UdpSocket,
    peer: SocketAddr,
    packet: &[u8],
    expect_block: u16,
) -> Result<(), TransferError> {
    let mut buf = [0u8; 1500];
    for _ in 0..MAX_RETRIES {
        socket.send_to(packet, peer).await?;
        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break, // retransmit
                Ok(result) => {
                    let (len, from) = result?;
                    if from != peer {
                        continue;
                    }
                    if parse_ack(&buf[..len]) == Some(expect_block) {
                        return Ok(());
                    }
                }
            }
        }
    }
    Err(TransferError::Stalled {
        peer,
        block: expect_block,
    })
}
