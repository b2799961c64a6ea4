use std::{
    fmt,
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::error::PacketError;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;
pub const URG: u8 = 0x20;
pub const ECE: u8 = 0x40;
pub const CWR: u8 = 0x80;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Number of leading payload bytes carried for banner extraction.
pub const PAYLOAD_HEAD_LEN: usize = 192;

/// Everything downstream stages need to know about a single packet, flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPacket {
    pub id: u64,
    pub timestamp: SystemTime,
    pub sip: IpAddr,
    pub dip: IpAddr,
    /// Source port for TCP and UDP, `type << 8 | code` for ICMP.
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    /// 802.1Q identifier, zero when untagged.
    pub vlan_id: u16,
    pub packet_len: u32,
    pub payload_len: u32,
    pub tcp_flags: u8,
    pub tcp_seq: u32,
    /// At most [`PAYLOAD_HEAD_LEN`] leading payload bytes.
    pub payload: Vec<u8>,
}

impl MetaPacket {
    pub fn new(timestamp: SystemTime, sip: IpAddr, dip: IpAddr, protocol: u8) -> Self {
        Self {
            id: 0,
            timestamp,
            sip,
            dip,
            sport: 0,
            dport: 0,
            protocol,
            vlan_id: 0,
            packet_len: 0,
            payload_len: 0,
            tcp_flags: 0,
            tcp_seq: 0,
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    #[inline]
    pub fn has_flags(&self, flags: u8) -> bool {
        self.tcp_flags & flags == flags
    }

    pub fn validate(&self) -> Result<(), PacketError> {
        if self.sip.is_ipv4() != self.dip.is_ipv4() {
            return Err(PacketError::MixedFamilies);
        }
        if self.payload_len > self.packet_len {
            return Err(PacketError::PayloadTooLong {
                payload: self.payload_len,
                packet: self.packet_len,
            });
        }
        if !self.is_tcp() && (self.tcp_flags != 0 || self.tcp_seq != 0) {
            return Err(PacketError::TcpFieldsOnNonTcp(self.protocol));
        }
        if self.payload.len() > PAYLOAD_HEAD_LEN || self.payload.len() > self.payload_len as usize
        {
            return Err(PacketError::PayloadHead {
                head: self.payload.len(),
                payload: self.payload_len,
            });
        }
        Ok(())
    }
}

impl fmt::Display for MetaPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        write!(
            f,
            "{}.{:06} {} {} -> {} sport {} dport {} payload: {}",
            ts.as_secs(),
            ts.subsec_micros(),
            protocol_name(self.protocol),
            self.sip,
            self.dip,
            self.sport,
            self.dport,
            self.payload_len
        )
    }
}

pub fn protocol_name(proto: u8) -> &'static str {
    match proto {
        PROTO_ICMP => "ICMPv4",
        PROTO_TCP => "TCP",
        PROTO_UDP => "UDP",
        PROTO_ICMPV6 => "ICMPv6",
        _ => "Unknown",
    }
}

/// Flag combinations that no well-behaved stack sends: SYN with FIN, a packet with neither FIN
/// nor ACK, and a packet with no flags at all.
pub fn suspicious_tcp_flags(flags: u8) -> bool {
    let has = |f: u8| flags & f == f;
    (has(SYN) && has(FIN))
        || (!has(FIN) && !has(ACK))
        || flags & (FIN | SYN | RST | PSH | ACK | URG) == 0
}
