//! DHCPv4 frame codec.
//!
//! Parses and serializes the RFC 2131 fixed header plus an ordered option
//! list. Only the options this system actually touches get typed accessors;
//! everything else stays available as raw bytes so replies can echo what
//! they do not interpret.

use std::net::Ipv4Addr;

use anyhow::{bail, Context};

use crate::{opt, MacAddr, MessageType, OpCode};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const HEADER_LEN: usize = 236;

/// Minimum BOOTP payload size; shorter replies get zero-padded.
const MIN_PACKET_LEN: usize = 300;

/// A DHCPv4 message: fixed header fields plus options in wire order.
#[derive(Debug, Clone)]
pub struct DhcpFrame {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    options: Vec<(u8, Vec<u8>)>,
}

impl DhcpFrame {
    /// Parse a frame from raw UDP payload bytes.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < HEADER_LEN + 4 {
            bail!("DHCP packet too short: {} bytes", data.len());
        }
        if data[HEADER_LEN..HEADER_LEN + 4] != MAGIC_COOKIE {
            bail!("missing DHCP magic cookie");
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let mut frame = DhcpFrame {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            sname,
            file,
            options: Vec::new(),
        };

        let mut cursor = HEADER_LEN + 4;
        while cursor < data.len() {
            let code = data[cursor];
            cursor += 1;
            match code {
                opt::END => break,
                0 => continue, // pad
                _ => {
                    if cursor >= data.len() {
                        bail!("truncated option {code}");
                    }
                    let len = data[cursor] as usize;
                    cursor += 1;
                    if cursor + len > data.len() {
                        bail!("option {code} overruns packet");
                    }
                    frame.options.push((code, data[cursor..cursor + len].to_vec()));
                    cursor += len;
                }
            }
        }

        Ok(frame)
    }

    /// Serialize to wire bytes, padded to the BOOTP minimum.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);
        for (code, value) in &self.options {
            buf.push(*code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf.push(opt::END);
        if buf.len() < MIN_PACKET_LEN {
            buf.resize(MIN_PACKET_LEN, 0);
        }
        buf
    }

    /// Client hardware address, when `htype`/`hlen` describe Ethernet.
    pub fn mac(&self) -> anyhow::Result<MacAddr> {
        if self.htype != 1 || self.hlen != 6 {
            bail!(
                "unsupported hardware address: htype={} hlen={}",
                self.htype,
                self.hlen
            );
        }
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.chaddr[..6]);
        Ok(MacAddr::new(octets))
    }

    pub fn set_mac(&mut self, mac: MacAddr) {
        self.htype = 1;
        self.hlen = 6;
        self.chaddr = [0u8; 16];
        self.chaddr[..6].copy_from_slice(&mac.octets());
    }

    /// First occurrence of an option, raw bytes.
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    /// Replace an option in place, or append it.
    pub fn set_option(&mut self, code: u8, value: impl Into<Vec<u8>>) {
        let value = value.into();
        debug_assert!(value.len() <= 255);
        if let Some(slot) = self.options.iter_mut().find(|(c, _)| *c == code) {
            slot.1 = value;
        } else {
            self.options.push((code, value));
        }
    }

    pub fn clear_option(&mut self, code: u8) {
        self.options.retain(|(c, _)| *c != code);
    }

    fn option_string(&self, code: u8) -> Option<String> {
        self.option(code)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn message_type(&self) -> anyhow::Result<MessageType> {
        let raw = self
            .option(opt::MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
            .context("missing DHCP message type option")?;
        MessageType::try_from(raw)
    }

    /// Vendor class identifier (option 60) as a string.
    pub fn vendor_class(&self) -> Option<String> {
        self.option_string(opt::VENDOR_CLASS)
    }

    /// User classes (option 77). RFC 3004 frames each class with a length
    /// byte; iPXE sends the bare string, so fall back to that when the
    /// framed reading does not consume the option exactly.
    pub fn user_classes(&self) -> Vec<String> {
        let Some(raw) = self.option(opt::USER_CLASS) else {
            return Vec::new();
        };
        let mut classes = Vec::new();
        let mut cursor = 0;
        while cursor < raw.len() {
            let len = raw[cursor] as usize;
            cursor += 1;
            if len == 0 || cursor + len > raw.len() {
                return vec![String::from_utf8_lossy(raw).into_owned()];
            }
            classes.push(String::from_utf8_lossy(&raw[cursor..cursor + len]).into_owned());
            cursor += len;
        }
        classes
    }

    /// Client system architecture (option 93, RFC 4578).
    pub fn client_arch(&self) -> Option<u16> {
        let raw = self.option(opt::CLIENT_ARCH)?;
        if raw.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        let raw = self.option(opt::SERVER_IDENTIFIER)?;
        let octets: [u8; 4] = raw.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        let raw = self.option(opt::REQUESTED_IP)?;
        let octets: [u8; 4] = raw.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Start a reply to this frame: BOOTREPLY with the request's xid, flags,
    /// giaddr and chaddr carried over, and the reply message type set.
    pub fn reply(&self, mtype: MessageType) -> DhcpFrame {
        let mut reply = DhcpFrame {
            op: OpCode::BootReply as u8,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        };
        reply.set_option(opt::MESSAGE_TYPE, vec![mtype as u8]);
        // GUID must be mirrored when present or some firmware drops the reply.
        if let Some(guid) = self.option(opt::CLIENT_GUID) {
            let guid = guid.to_vec();
            reply.set_option(opt::CLIENT_GUID, guid);
        }
        reply
    }

    /// Build a fresh BOOTREQUEST for the lease client.
    pub fn request(xid: u32, mac: MacAddr) -> DhcpFrame {
        let mut frame = DhcpFrame {
            op: OpCode::BootRequest as u8,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: crate::FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0u8; 16],
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        };
        frame.set_mac(mac);
        frame
    }

    /// Set the boot filename in the fixed `file` field, NUL-terminated.
    pub fn set_boot_file(&mut self, path: &str) -> anyhow::Result<()> {
        let bytes = path.as_bytes();
        if bytes.len() >= self.file.len() {
            bail!("boot filename too long: {} bytes", bytes.len());
        }
        self.file = [0u8; 128];
        self.file[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn boot_file(&self) -> Option<String> {
        let end = self.file.iter().position(|&b| b == 0)?;
        if end == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&self.file[..end]).into_owned())
    }
}
