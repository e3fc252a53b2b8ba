//! Lease bookkeeping for standalone addressing mode.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::MacAddr;

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> anyhow::Result<Self> {
        if prefix_len == 0 || prefix_len > 30 {
            anyhow::bail!("prefix length {prefix_len} leaves no assignable subnet");
        }
        let mask = u32::MAX << (32 - prefix_len);
        let base = u32::from(network) & mask;
        Ok(Subnet {
            network: Ipv4Addr::from(base),
            prefix_len,
        })
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - self.prefix_len))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !(u32::MAX << (32 - self.prefix_len)))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix_len);
        u32::from(ip) & mask == u32::from(self.network)
    }

    /// Assignable host addresses, excluding network and broadcast.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network) + 1;
        let last = u32::from(self.broadcast());
        (first..last).map(Ipv4Addr::from)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("subnet {s:?} is not in CIDR form"))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow::anyhow!("bad network address in {s:?}"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| anyhow::anyhow!("bad prefix length in {s:?}"))?;
        Subnet::new(network, prefix_len)
    }
}

/// A live address assignment for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRecord {
    pub ip: Ipv4Addr,
    pub expires: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("address pool for {0} is exhausted")]
    PoolExhausted(Subnet),
    #[error("{requested} was not leased to {mac}")]
    NotOurLease { mac: MacAddr, requested: Ipv4Addr },
}

/// Tracks which MAC holds which address inside one subnet.
///
/// Records and the allocated-address set are locked independently and no
/// operation holds both locks at once; the address set is the single
/// authority on IP uniqueness.
pub struct LeaseRegistry {
    subnet: Subnet,
    server_ip: Ipv4Addr,
    lease_time: Duration,
    records: Mutex<HashMap<MacAddr, LeaseRecord>>,
    allocated: Mutex<HashSet<Ipv4Addr>>,
}

impl LeaseRegistry {
    pub fn new(subnet: Subnet, server_ip: Ipv4Addr, lease_time: Duration) -> Self {
        LeaseRegistry {
            subnet,
            server_ip,
            lease_time,
            records: Mutex::new(HashMap::new()),
            allocated: Mutex::new(HashSet::new()),
        }
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Renew the client's unexpired lease, or claim the next free address.
    pub fn allocate(&self, mac: MacAddr, now: Instant) -> Result<Ipv4Addr, LeaseError> {
        let renewed = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(&mac) {
                Some(record) if record.expires > now => {
                    record.expires = now + self.lease_time;
                    Some(record.ip)
                }
                _ => None,
            }
        };
        if let Some(ip) = renewed {
            return Ok(ip);
        }

        let ip = {
            let mut allocated = self.allocated.lock().unwrap();
            let ip = self
                .subnet
                .hosts()
                .find(|ip| *ip != self.server_ip && !allocated.contains(ip))
                .ok_or(LeaseError::PoolExhausted(self.subnet))?;
            allocated.insert(ip);
            ip
        };

        let displaced = {
            let mut records = self.records.lock().unwrap();
            records
                .insert(
                    mac,
                    LeaseRecord {
                        ip,
                        expires: now + self.lease_time,
                    },
                )
                .map(|old| old.ip)
        };
        // An expired record we displaced still owned its address.
        if let Some(old_ip) = displaced {
            if old_ip != ip {
                self.allocated.lock().unwrap().remove(&old_ip);
            }
        }

        Ok(ip)
    }

    /// Confirm that `requested` is what we leased to `mac`.
    pub fn confirm(
        &self,
        mac: MacAddr,
        requested: Ipv4Addr,
        now: Instant,
    ) -> Result<Ipv4Addr, LeaseError> {
        match self.lookup(mac, now) {
            Some(record) if record.ip == requested => {
                let mut records = self.records.lock().unwrap();
                if let Some(record) = records.get_mut(&mac) {
                    record.expires = now + self.lease_time;
                }
                Ok(requested)
            }
            _ => Err(LeaseError::NotOurLease { mac, requested }),
        }
    }

    pub fn lookup(&self, mac: MacAddr, now: Instant) -> Option<LeaseRecord> {
        let records = self.records.lock().unwrap();
        records.get(&mac).copied().filter(|r| r.expires > now)
    }

    /// Drop the client's record and free its address.
    pub fn release(&self, mac: MacAddr) {
        let removed = self.records.lock().unwrap().remove(&mac);
        if let Some(record) = removed {
            self.allocated.lock().unwrap().remove(&record.ip);
        }
    }

    /// Drop every expired record and free the addresses they held.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<(MacAddr, Ipv4Addr)> = {
            let mut records = self.records.lock().unwrap();
            let dead: Vec<(MacAddr, Ipv4Addr)> = records
                .iter()
                .filter(|(_, r)| r.expires <= now)
                .map(|(mac, r)| (*mac, r.ip))
                .collect();
            for (mac, _) in &dead {
                records.remove(mac);
            }
            dead
        };
        if !expired.is_empty() {
            let mut allocated = self.allocated.lock().unwrap();
            for (mac, ip) in expired {
                allocated.remove(&ip);
                tracing::debug!(%mac, %ip, "expired lease swept");
            }
        }
    }
}
