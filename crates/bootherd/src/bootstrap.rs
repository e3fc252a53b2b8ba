//! One-time network bootstrap.
//!
//! Before any listener binds, the target interface is brought up and we try
//! to get an address from an existing DHCP server. Getting one means a DHCP
//! server owns this segment and we run as a proxy; not getting one within
//! the deadline means the segment is ours, so we take a static address and
//! lease out of it ourselves.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{bail, Context};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use dhcp::{opt, DhcpFrame, MacAddr, MessageType, OpCode, Subnet};

use crate::orchestrator::Addressing;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 123, 1);
const FALLBACK_PREFIX: u8 = 24;

/// Configures the link itself. Separated out so bootstrap logic is testable
/// without CAP_NET_ADMIN.
pub trait LinkConfig: Send + Sync {
    fn bring_up(&self, interface: &str) -> std::io::Result<()>;
    fn assign(&self, interface: &str, ip: Ipv4Addr, mask: Ipv4Addr) -> std::io::Result<()>;
}

/// An address obtained from an existing DHCP server. The mask is applied
/// verbatim; proxy mode never allocates out of it, so even a /31 or /32
/// lease is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// Talks to whatever DHCP server may be on the segment.
#[async_trait::async_trait]
pub trait LeaseNegotiator: Send + Sync {
    async fn negotiate(&self) -> anyhow::Result<Lease>;
}

/// The bootstrap outcome the orchestrator is configured from.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub server_ip: Ipv4Addr,
    pub addressing: Addressing,
}

/// Bring the interface up and decide the addressing mode.
pub async fn bootstrap(
    interface: &str,
    link: &dyn LinkConfig,
    negotiator: &dyn LeaseNegotiator,
) -> anyhow::Result<NetworkPlan> {
    bootstrap_with_timeout(interface, link, negotiator, NEGOTIATION_TIMEOUT).await
}

async fn bootstrap_with_timeout(
    interface: &str,
    link: &dyn LinkConfig,
    negotiator: &dyn LeaseNegotiator,
    deadline: Duration,
) -> anyhow::Result<NetworkPlan> {
    for name in usable_interfaces() {
        info!(interface = %name, "usable interface");
    }

    link.bring_up(interface)
        .with_context(|| format!("bringing {interface} up"))?;
    info!(%interface, "link up");

    match tokio::time::timeout(deadline, negotiator.negotiate()).await {
        Ok(Ok(lease)) => {
            link.assign(interface, lease.ip, lease.mask)
                .with_context(|| format!("assigning {} to {interface}", lease.ip))?;
            info!(ip = %lease.ip, mask = %lease.mask, "joined existing DHCP segment");
            Ok(NetworkPlan {
                server_ip: lease.ip,
                addressing: Addressing::Proxy,
            })
        }
        // No DHCP server answered, or negotiation broke down. Either way the
        // segment has no addressing authority, so become it.
        other => {
            if let Ok(Err(err)) = other {
                warn!(%err, "DHCP negotiation failed");
            }
            let subnet = Subnet::new(FALLBACK_ADDRESS, FALLBACK_PREFIX)?;
            info!(ip = %FALLBACK_ADDRESS, %subnet, "no DHCP server found, going standalone");
            match link.assign(interface, FALLBACK_ADDRESS, subnet.mask()) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("assigning {FALLBACK_ADDRESS} to {interface}"))
                }
            }
            Ok(NetworkPlan {
                server_ip: FALLBACK_ADDRESS,
                addressing: Addressing::Standalone { subnet },
            })
        }
    }
}

/// Interfaces that are up and not loopback.
pub fn usable_interfaces() -> Vec<String> {
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for ifaddr in addrs {
        let flags = ifaddr.flags;
        if !flags.contains(nix::net::if_::InterfaceFlags::IFF_UP)
            || flags.contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        if !names.contains(&ifaddr.interface_name) {
            names.push(ifaddr.interface_name);
        }
    }
    names
}

/// The interface's hardware address, from its link-layer ifaddr entry.
pub fn interface_mac(interface: &str) -> anyhow::Result<MacAddr> {
    let addrs = nix::ifaddrs::getifaddrs().context("enumerating interfaces")?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        if let Some(link) = ifaddr.address.as_ref().and_then(|a| a.as_link_addr()) {
            if let Some(octets) = link.addr() {
                return Ok(MacAddr::new(octets));
            }
        }
    }
    bail!("no hardware address found for {interface}")
}

/// Link configuration through the classic SIOCSIF* ioctls.
pub struct IoctlLink;

fn ifreq_for(interface: &str) -> std::io::Result<libc::ifreq> {
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = interface.as_bytes();
    if bytes.len() >= req.ifr_name.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("interface name {interface:?} too long"),
        ));
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(req)
}

fn sockaddr_in(ip: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Run one ioctl against a throwaway AF_INET socket.
fn ioctl(request: libc::c_ulong, req: &mut libc::ifreq) -> std::io::Result<()> {
    // SAFETY: req is a valid, fully initialized ifreq for the requests used
    // here; the fd is closed before returning.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let rc = libc::ioctl(fd, request as _, req as *mut libc::ifreq);
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if rc < 0 {
            return Err(err);
        }
    }
    Ok(())
}

impl LinkConfig for IoctlLink {
    fn bring_up(&self, interface: &str) -> std::io::Result<()> {
        let mut req = ifreq_for(interface)?;
        ioctl(libc::SIOCGIFFLAGS, &mut req)?;
        unsafe {
            req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        ioctl(libc::SIOCSIFFLAGS, &mut req)
    }

    fn assign(&self, interface: &str, ip: Ipv4Addr, mask: Ipv4Addr) -> std::io::Result<()> {
        let mut req = ifreq_for(interface)?;
        unsafe {
            *(&mut req.ifr_ifru.ifru_addr as *mut libc::sockaddr as *mut libc::sockaddr_in) =
                sockaddr_in(ip);
        }
        ioctl(libc::SIOCSIFADDR, &mut req)?;

        let mut req = ifreq_for(interface)?;
        unsafe {
            *(&mut req.ifr_ifru.ifru_netmask as *mut libc::sockaddr as *mut libc::sockaddr_in) =
                sockaddr_in(mask);
        }
        ioctl(libc::SIOCSIFNETMASK, &mut req)
    }
}

/// A real DISCOVER/OFFER, REQUEST/ACK client over a broadcast socket.
pub struct BroadcastLeaseClient {
    interface: String,
    mac: MacAddr,
}

impl BroadcastLeaseClient {
    pub fn new(interface: &str, mac: MacAddr) -> Self {
        BroadcastLeaseClient {
            interface: interface.to_string(),
            mac,
        }
    }

    fn client_socket(&self) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating DHCP client socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let index = nix::net::if_::if_nametoindex(self.interface.as_str())
            .with_context(|| format!("looking up {}", self.interface))?;
        socket.bind_device_by_index_v4(NonZeroU32::new(index))?;
        socket
            .bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68)).into())
            .context("binding DHCP client port 68")?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into()).context("registering DHCP client socket")
    }

    /// Wait for a BOOTREPLY of the given type addressed to us.
    async fn await_reply(
        &self,
        socket: &UdpSocket,
        xid: u32,
        mtype: MessageType,
    ) -> anyhow::Result<DhcpFrame> {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, _) = socket.recv_from(&mut buf).await?;
            let Ok(frame) = DhcpFrame::parse(&buf[..len]) else {
                continue;
            };
            if frame.op != OpCode::BootReply as u8 || frame.xid != xid {
                continue;
            }
            if frame.mac().map(|m| m != self.mac).unwrap_or(true) {
                continue;
            }
            match frame.message_type() {
                Ok(t) if t == mtype => return Ok(frame),
                Ok(MessageType::Nak) => bail!("server NAKed our request"),
                _ => continue,
            }
        }
    }
}

#[async_trait::async_trait]
impl LeaseNegotiator for BroadcastLeaseClient {
    async fn negotiate(&self) -> anyhow::Result<Lease> {
        let socket = self.client_socket()?;
        let server = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 67));
        let xid: u32 = rand::random();

        let mut discover = DhcpFrame::request(xid, self.mac);
        discover.set_option(opt::MESSAGE_TYPE, vec![MessageType::Discover as u8]);
        discover.set_option(
            opt::PARAMETER_REQUEST,
            vec![opt::SUBNET_MASK, opt::ROUTER, opt::LEASE_TIME],
        );
        socket.send_to(&discover.serialize(), server).await?;

        let offer = self.await_reply(&socket, xid, MessageType::Offer).await?;
        let offered = offer.yiaddr;
        let server_id = offer
            .server_identifier()
            .context("OFFER without a server identifier")?;
        info!(ip = %offered, server = %server_id, "received DHCP offer");

        let mut request = DhcpFrame::request(xid, self.mac);
        request.set_option(opt::MESSAGE_TYPE, vec![MessageType::Request as u8]);
        request.set_option(opt::REQUESTED_IP, offered.octets().to_vec());
        request.set_option(opt::SERVER_IDENTIFIER, server_id.octets().to_vec());
        socket.send_to(&request.serialize(), server).await?;

        let ack = self.await_reply(&socket, xid, MessageType::Ack).await?;
        let mask = ack
            .option(opt::SUBNET_MASK)
            .and_then(|raw| <[u8; 4]>::try_from(raw).ok())
            .map(Ipv4Addr::from)
            .context("ACK without a subnet mask")?;

        Ok(Lease {
            ip: ack.yiaddr,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLink {
        calls: Mutex<Vec<String>>,
        fail_bring_up: bool,
        assign_exists: bool,
    }

    impl LinkConfig for FakeLink {
        fn bring_up(&self, interface: &str) -> std::io::Result<()> {
            if self.fail_bring_up {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "no CAP_NET_ADMIN",
                ));
            }
            self.calls.lock().unwrap().push(format!("up {interface}"));
            Ok(())
        }

        fn assign(&self, interface: &str, ip: Ipv4Addr, mask: Ipv4Addr) -> std::io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("assign {interface} {ip} {mask}"));
            if self.assign_exists {
                return Err(std::io::ErrorKind::AlreadyExists.into());
            }
            Ok(())
        }
    }

    struct FixedLease(Lease);

    #[async_trait::async_trait]
    impl LeaseNegotiator for FixedLease {
        async fn negotiate(&self) -> anyhow::Result<Lease> {
            Ok(self.0)
        }
    }

    struct NeverAnswers;

    #[async_trait::async_trait]
    impl LeaseNegotiator for NeverAnswers {
        async fn negotiate(&self) -> anyhow::Result<Lease> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn lease_selects_proxy_mode() {
        let link = FakeLink::default();
        let lease = Lease {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        };
        let plan = bootstrap_with_timeout(
            "eth0",
            &link,
            &FixedLease(lease),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(plan.server_ip, Ipv4Addr::new(10, 1, 2, 3));
        assert!(matches!(plan.addressing, Addressing::Proxy));
        assert_eq!(
            *link.calls.lock().unwrap(),
            vec!["up eth0", "assign eth0 10.1.2.3 255.255.255.0"]
        );
    }

    #[tokio::test]
    async fn point_to_point_lease_still_selects_proxy_mode() {
        // Some segments hand out /31 or /32 leases; those are fine for an
        // address we only bind to, and must not shunt us into standalone.
        let link = FakeLink::default();
        let lease = Lease {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            mask: Ipv4Addr::new(255, 255, 255, 254),
        };
        let plan = bootstrap_with_timeout(
            "eth0",
            &link,
            &FixedLease(lease),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(plan.server_ip, Ipv4Addr::new(10, 1, 2, 3));
        assert!(matches!(plan.addressing, Addressing::Proxy));
        assert_eq!(
            *link.calls.lock().unwrap(),
            vec!["up eth0", "assign eth0 10.1.2.3 255.255.255.254"]
        );
    }

    #[tokio::test]
    async fn timeout_selects_standalone_mode() {
        let link = FakeLink::default();
        let plan = bootstrap_with_timeout(
            "eth0",
            &link,
            &NeverAnswers,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert_eq!(plan.server_ip, Ipv4Addr::new(192, 168, 123, 1));
        match plan.addressing {
            Addressing::Standalone { subnet } => {
                assert_eq!(subnet.to_string(), "192.168.123.0/24");
            }
            Addressing::Proxy => panic!("expected standalone mode"),
        }
    }

    #[tokio::test]
    async fn existing_address_is_tolerated_in_fallback() {
        let link = FakeLink {
            assign_exists: true,
            ..Default::default()
        };
        let plan = bootstrap_with_timeout(
            "eth0",
            &link,
            &NeverAnswers,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(matches!(plan.addressing, Addressing::Standalone { .. }));
    }

    #[tokio::test]
    async fn link_activation_failure_is_fatal() {
        let link = FakeLink {
            fail_bring_up: true,
            ..Default::default()
        };
        let result = bootstrap_with_timeout(
            "eth0",
            &link,
            &NeverAnswers,
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
