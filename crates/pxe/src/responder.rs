//! UDP responders for boot-service discovery and DHCP.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use dhcp::{opt, DhcpFrame, LeaseRegistry, MessageType, FLAG_BROADCAST};

use crate::classify::boot_path;
use crate::types::{decode_arch, Machine};

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;

/// How the DHCP responder hands out addresses.
pub enum AddressMode {
    /// Another DHCP server owns addressing; we only add boot options.
    Proxy,
    /// We are the only DHCP server on the wire and run the full exchange.
    Standalone { registry: Arc<LeaseRegistry> },
}

fn broadcast_socket(bind: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating UDP socket")?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket
        .bind(&SocketAddr::V4(bind).into())
        .with_context(|| format!("binding {bind}"))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).context("registering socket with the runtime")
}

/// Render option-77 user classes as `[a,b]`, or `[]` when absent.
fn class_info(frame: &DhcpFrame) -> String {
    format!("[{}]", frame.user_classes().join(","))
}

/// Attach the boot pointer options shared by every reply we send.
fn set_boot_options(reply: &mut DhcpFrame, server_ip: Ipv4Addr, path: &str) -> anyhow::Result<()> {
    reply.siaddr = server_ip;
    reply.set_boot_file(path)?;
    reply.set_option(opt::SERVER_IDENTIFIER, server_ip.octets().to_vec());
    reply.set_option(opt::TFTP_SERVER_NAME, server_ip.to_string());
    reply.set_option(opt::BOOTFILE_NAME, path);
    reply.set_option(opt::VENDOR_CLASS, "PXEClient");
    Ok(())
}

/// Boot-service discovery responder (the port-4011 listener).
///
/// PXE firmware that accepted a proxied offer comes back here unicast to ask
/// for its boot file. Replies carry `siaddr` and a filename the classifier
/// can take apart again.
pub struct PxeResponder {
    server_ip: Ipv4Addr,
    socket: UdpSocket,
}

impl PxeResponder {
    pub async fn bind(server_ip: Ipv4Addr, port: u16) -> anyhow::Result<Self> {
        let socket = broadcast_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        info!(addr = %socket.local_addr()?, "PXE responder listening");
        Ok(PxeResponder { server_ip, socket })
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
                .context("receiving on PXE socket")?;
            let frame = match DhcpFrame::parse(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%peer, %err, "ignoring unparseable PXE packet");
                    continue;
                }
            };
            match reply_for(&frame, self.server_ip) {
                Ok(Some(reply)) => {
                    if let Err(err) = self.socket.send_to(&reply.serialize(), peer).await {
                        warn!(%peer, %err, "failed to send PXE reply");
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(%peer, %err, "ignoring PXE request"),
            }
        }
    }
}

/// Build the boot-service reply for one request, or `None` when the request
/// is not PXE boot traffic. Pure so tests can drive it without sockets.
pub fn reply_for(frame: &DhcpFrame, server_ip: Ipv4Addr) -> anyhow::Result<Option<DhcpFrame>> {
    if frame.message_type()? != MessageType::Request
        && frame.message_type()? != MessageType::Discover
    {
        return Ok(None);
    }
    let Some(class_id) = frame.vendor_class() else {
        return Ok(None);
    };
    if !class_id.starts_with("PXEClient") {
        return Ok(None);
    }
    let arch = frame.client_arch().context("missing client architecture")?;
    let (architecture, firmware) =
        decode_arch(arch).with_context(|| format!("unsupported client architecture {arch}"))?;

    let machine = Machine {
        mac: frame.mac()?,
        arch: architecture,
    };
    let path = boot_path(machine.mac, &class_id, &class_info(frame));
    debug!(mac = %machine.mac, arch = %machine.arch, ?firmware, %path, "answering boot-service request");

    let mut reply = frame.reply(MessageType::Ack);
    set_boot_options(&mut reply, server_ip, &path)?;
    Ok(Some(reply))
}

/// The port-67 DHCP responder.
///
/// Shares the boot-option logic with [`PxeResponder`]; in standalone mode it
/// additionally runs the DISCOVER/OFFER, REQUEST/ACK exchange against the
/// lease registry.
pub struct DhcpResponder {
    server_ip: Ipv4Addr,
    mode: AddressMode,
    socket: UdpSocket,
}

impl DhcpResponder {
    pub async fn bind(server_ip: Ipv4Addr, port: u16, mode: AddressMode) -> anyhow::Result<Self> {
        let socket = broadcast_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        let mode_name = match mode {
            AddressMode::Proxy => "proxy",
            AddressMode::Standalone { .. } => "standalone",
        };
        info!(addr = %socket.local_addr()?, mode = mode_name, "DHCP responder listening");
        Ok(DhcpResponder {
            server_ip,
            mode,
            socket,
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
                .context("receiving on DHCP socket")?;
            let frame = match DhcpFrame::parse(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%peer, %err, "ignoring unparseable DHCP packet");
                    continue;
                }
            };
            match self.handle(&frame) {
                Ok(Some(reply)) => {
                    if let Err(err) = self.send_reply(&frame, &reply).await {
                        warn!(%peer, %err, "failed to send DHCP reply");
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(%peer, %err, "ignoring DHCP request"),
            }
        }
    }

    fn handle(&self, frame: &DhcpFrame) -> anyhow::Result<Option<DhcpFrame>> {
        match &self.mode {
            AddressMode::Proxy => self.handle_proxy(frame),
            AddressMode::Standalone { registry } => {
                self.handle_standalone(frame, registry, Instant::now())
            }
        }
    }

    /// Proxy mode: answer PXE DISCOVERs with boot options and no address.
    pub fn handle_proxy(&self, frame: &DhcpFrame) -> anyhow::Result<Option<DhcpFrame>> {
        if frame.message_type()? != MessageType::Discover {
            return Ok(None);
        }
        let Some(mut reply) = reply_for(frame, self.server_ip)? else {
            return Ok(None);
        };
        reply.set_option(opt::MESSAGE_TYPE, vec![MessageType::Offer as u8]);
        // The real DHCP server assigns addresses; ours stays zero.
        reply.yiaddr = Ipv4Addr::UNSPECIFIED;
        Ok(Some(reply))
    }

    /// Standalone mode: full addressing exchange backed by the registry.
    pub fn handle_standalone(
        &self,
        frame: &DhcpFrame,
        registry: &LeaseRegistry,
        now: Instant,
    ) -> anyhow::Result<Option<DhcpFrame>> {
        let mac = frame.mac()?;
        match frame.message_type()? {
            MessageType::Discover => {
                registry.sweep(now);
                let ip = registry.allocate(mac, now)?;
                info!(%mac, %ip, "offering address");
                let mut reply = self.address_reply(frame, registry, ip, MessageType::Offer)?;
                self.maybe_boot_options(frame, &mut reply)?;
                Ok(Some(reply))
            }
            MessageType::Request => {
                // A request aimed at another server is none of our business.
                if let Some(server) = frame.server_identifier() {
                    if server != self.server_ip {
                        return Ok(None);
                    }
                }
                let requested = frame
                    .requested_ip()
                    .or_else(|| {
                        (frame.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(frame.ciaddr)
                    })
                    .context("REQUEST without a requested address")?;
                match registry.confirm(mac, requested, now) {
                    Ok(ip) => {
                        info!(%mac, %ip, "acknowledging lease");
                        let mut reply = self.address_reply(frame, registry, ip, MessageType::Ack)?;
                        self.maybe_boot_options(frame, &mut reply)?;
                        Ok(Some(reply))
                    }
                    Err(err) => {
                        warn!(%mac, %requested, %err, "rejecting lease request");
                        let mut reply = frame.reply(MessageType::Nak);
                        reply.set_option(opt::SERVER_IDENTIFIER, self.server_ip.octets().to_vec());
                        Ok(Some(reply))
                    }
                }
            }
            MessageType::Release => {
                info!(%mac, "lease released");
                registry.release(mac);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn address_reply(
        &self,
        frame: &DhcpFrame,
        registry: &LeaseRegistry,
        ip: Ipv4Addr,
        mtype: MessageType,
    ) -> anyhow::Result<DhcpFrame> {
        let mut reply = frame.reply(mtype);
        reply.yiaddr = ip;
        reply.set_option(opt::SERVER_IDENTIFIER, self.server_ip.octets().to_vec());
        reply.set_option(opt::SUBNET_MASK, registry.subnet().mask().octets().to_vec());
        reply.set_option(opt::ROUTER, self.server_ip.octets().to_vec());
        let secs = registry.lease_time().as_secs() as u32;
        reply.set_option(opt::LEASE_TIME, secs.to_be_bytes().to_vec());
        Ok(reply)
    }

    /// PXE-capable clients get boot options on top of their address.
    fn maybe_boot_options(&self, frame: &DhcpFrame, reply: &mut DhcpFrame) -> anyhow::Result<()> {
        let is_pxe = frame
            .vendor_class()
            .map(|c| c.starts_with("PXEClient"))
            .unwrap_or(false);
        if is_pxe && frame.client_arch().and_then(decode_arch).is_some() {
            let class_id = frame.vendor_class().unwrap_or_default();
            let path = boot_path(frame.mac()?, &class_id, &class_info(frame));
            let yiaddr = reply.yiaddr;
            set_boot_options(reply, self.server_ip, &path)?;
            reply.yiaddr = yiaddr;
        }
        Ok(())
    }

    /// RFC 2131 §4.1 destination selection, without raw-socket unicast: relay
    /// agents get the reply at giaddr, configured clients at ciaddr, and
    /// everything else the subnet broadcast.
    async fn send_reply(&self, request: &DhcpFrame, reply: &DhcpFrame) -> anyhow::Result<()> {
        let dest = if request.giaddr != Ipv4Addr::UNSPECIFIED {
            SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
        } else if request.ciaddr != Ipv4Addr::UNSPECIFIED
            && request.flags & FLAG_BROADCAST == 0
        {
            SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
        } else {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        };
        self.socket
            .send_to(&reply.serialize(), SocketAddr::V4(dest))
            .await
            .with_context(|| format!("sending DHCP reply to {dest}"))?;
        Ok(())
    }
}
