use std::{fmt, net::IpAddr};

use serde::Serialize;

use crate::packet::{protocol_name, MetaPacket, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};

const FNV_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// Incremental FNV-1a over a byte stream.
#[derive(Debug, Clone, Copy)]
struct Fnv1a(u64);

impl Fnv1a {
    #[inline]
    fn new() -> Self {
        Self(FNV_BASIS)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    fn write_ip(&mut self, ip: &IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.write(&[4]);
                self.write(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.write(&[6]);
                self.write(&v6.octets());
            }
        }
    }
}

/// A directional 5-tuple plus the 802.1Q VLAN identifier.
///
/// `A -> B` and `B -> A` are different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
    pub vlan_id: u16,
}

impl FlowKey {
    #[inline]
    pub fn from_packet(mp: &MetaPacket) -> Self {
        Self {
            sip: mp.sip,
            dip: mp.dip,
            sport: mp.sport,
            dport: mp.dport,
            proto: mp.protocol,
            vlan_id: mp.vlan_id,
        }
    }

    /// Quick non-cryptographic hash of the key. Process-local only: the value may change between
    /// versions and must never be persisted as an identifier.
    pub fn hash(&self) -> u64 {
        let mut h = Fnv1a::new();
        h.write_ip(&self.sip);
        h.write_ip(&self.dip);
        h.write(&self.sport.to_be_bytes());
        h.write(&self.dport.to_be_bytes());
        h.write(&[self.proto]);
        h.write(&self.vlan_id.to_be_bytes());
        h.0
    }

    pub fn reverse(&self) -> Self {
        Self {
            sip: self.dip,
            dip: self.sip,
            sport: self.dport,
            dport: self.sport,
            ..*self
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = protocol_name(self.proto);
        match self.proto {
            PROTO_TCP | PROTO_UDP => match self.sip {
                IpAddr::V4(_) => write!(
                    f,
                    "{} {}:{} -> {}:{}",
                    name, self.sip, self.sport, self.dip, self.dport
                ),
                IpAddr::V6(_) => write!(
                    f,
                    "{} {}.{} -> {}.{}",
                    name, self.sip, self.sport, self.dip, self.dport
                ),
            },
            PROTO_ICMP | PROTO_ICMPV6 => write!(
                f,
                "{} {}:{} {} -> {}",
                name,
                self.sport >> 8,
                self.sport & 0xff,
                self.sip,
                self.dip
            ),
            _ => write!(f, "* Unknown flow *"),
        }
    }
}
