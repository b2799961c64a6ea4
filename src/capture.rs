//! Packet source: reads frames from a pcap file or a live device and flattens them into
//! [`MetaPacket`]s.

use std::{
    net::IpAddr,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use etherparse::{InternetSlice, SlicedPacket, TransportSlice, VlanSlice};
use log::{debug, info};
use pcap::{Activated, Active, Capture, Device, Offline};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    packet::{
        MetaPacket, ACK, FIN, PAYLOAD_HEAD_LEN, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP,
        PSH, RST, SYN, URG,
    },
};

/// Read timeout for live devices, in milliseconds.
pub const READ_TIMEOUT_MS: i32 = 1000;

/// ICMP type, code, checksum and the echo identifier/sequence words.
const ICMP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub packets: u64,
    pub bytes: u64,
    pub decoded: u64,
    pub truncated: u64,
    pub undecodable: u64,
    pub non_ip: u64,
}

/// One read from a [`CaptureSource`].
#[derive(Debug)]
pub enum Captured {
    Packet(MetaPacket),
    /// A live read timed out without traffic.
    Timeout,
    /// A frame was read but carries nothing to assign to a flow.
    Skipped,
}

enum Handle {
    File(Capture<Offline>),
    Live(Capture<Active>),
}

pub struct CaptureSource {
    handle: Handle,
    stats: CaptureStats,
}

impl CaptureSource {
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let capture = Capture::from_file(path.as_ref())?;
        info!("reading packets from {}", path.as_ref().display());
        Ok(Self {
            handle: Handle::File(capture),
            stats: CaptureStats::default(),
        })
    }

    pub fn open_device(name: &str, snaplen: i32) -> Result<Self> {
        let device = Device::list()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::Config(format!("no matching device found: {}", name)))?;
        let capture = Capture::from_device(device)?
            .promisc(true)
            .snaplen(snaplen)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        info!("capturing on {} (snaplen {})", name, snaplen);
        Ok(Self {
            handle: Handle::Live(capture),
            stats: CaptureStats::default(),
        })
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self.handle, Handle::Live(_))
    }

    #[inline]
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Reads the next frame. `Ok(None)` means the file is exhausted.
    pub fn next_packet(&mut self) -> Result<Option<Captured>> {
        match &mut self.handle {
            Handle::File(cap) => read_next(cap, &mut self.stats),
            Handle::Live(cap) => read_next(cap, &mut self.stats),
        }
    }
}

fn read_next<T: Activated + ?Sized>(
    cap: &mut Capture<T>,
    stats: &mut CaptureStats,
) -> Result<Option<Captured>> {
    let packet = match cap.next() {
        Ok(packet) => packet,
        Err(pcap::Error::NoMorePackets) => return Ok(None),
        Err(pcap::Error::TimeoutExpired) => return Ok(Some(Captured::Timeout)),
        Err(e) => return Err(e.into()),
    };

    stats.packets += 1;
    stats.bytes += packet.header.len as u64;
    if packet.header.caplen < packet.header.len {
        stats.truncated += 1;
    }

    let ts = packet.header.ts;
    let timestamp = UNIX_EPOCH
        + Duration::from_secs(ts.tv_sec as u64)
        + Duration::from_micros(ts.tv_usec as u64);

    match decode(stats.packets, timestamp, packet.data, packet.header.len) {
        Ok(Some(mp)) => {
            stats.decoded += 1;
            Ok(Some(Captured::Packet(mp)))
        }
        Ok(None) => {
            stats.non_ip += 1;
            Ok(Some(Captured::Skipped))
        }
        Err(e) => {
            stats.undecodable += 1;
            debug!("{}", e);
            Ok(Some(Captured::Skipped))
        }
    }
}

/// Flattens an Ethernet frame. Frames without an IP layer decode to `Ok(None)`.
pub fn decode(id: u64, timestamp: SystemTime, data: &[u8], wire_len: u32) -> Result<Option<MetaPacket>> {
    let sliced = SlicedPacket::from_ethernet(data).map_err(|e| Error::Decode {
        id,
        reason: format!("{:?}", e),
    })?;

    let (sip, dip, protocol) = match &sliced.ip {
        Some(InternetSlice::Ipv4(header, _extensions)) => (
            IpAddr::from(header.source()),
            IpAddr::from(header.destination()),
            header.protocol(),
        ),
        Some(InternetSlice::Ipv6(header, _extensions)) => (
            IpAddr::from(header.source()),
            IpAddr::from(header.destination()),
            header.next_header(),
        ),
        None => return Ok(None),
    };

    let mut mp = MetaPacket::new(timestamp, sip, dip, protocol);
    mp.id = id;
    mp.packet_len = wire_len.max(data.len() as u32);
    mp.vlan_id = match &sliced.vlan {
        Some(VlanSlice::SingleVlan(vlan)) => vlan.vlan_identifier(),
        Some(VlanSlice::DoubleVlan(vlan)) => vlan.outer().vlan_identifier(),
        None => 0,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            mp.protocol = PROTO_TCP;
            mp.sport = tcp.source_port();
            mp.dport = tcp.destination_port();
            mp.tcp_seq = tcp.sequence_number();
            mp.tcp_flags = [
                (tcp.fin(), FIN),
                (tcp.syn(), SYN),
                (tcp.rst(), RST),
                (tcp.psh(), PSH),
                (tcp.ack(), ACK),
                (tcp.urg(), URG),
            ]
            .iter()
            .filter(|(set, _)| *set)
            .fold(0, |acc, (_, bit)| acc | bit);
            set_payload(&mut mp, sliced.payload);
        }
        Some(TransportSlice::Udp(udp)) => {
            mp.protocol = PROTO_UDP;
            mp.sport = udp.source_port();
            mp.dport = udp.destination_port();
            set_payload(&mut mp, sliced.payload);
        }
        _ if protocol == PROTO_ICMP || protocol == PROTO_ICMPV6 => {
            // ICMP carries its type and code where the ports would be
            if sliced.payload.len() >= 2 {
                mp.sport = (sliced.payload[0] as u16) << 8 | sliced.payload[1] as u16;
            }
            mp.payload_len = sliced.payload.len().saturating_sub(ICMP_HEADER_LEN) as u32;
        }
        _ => {
            mp.payload_len = sliced.payload.len() as u32;
        }
    }

    Ok(Some(mp))
}

fn set_payload(mp: &mut MetaPacket, payload: &[u8]) {
    mp.payload_len = payload.len() as u32;
    let head = payload.len().min(PAYLOAD_HEAD_LEN);
    mp.payload = payload[..head].to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn ts() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1240866004)
    }

    fn tcp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 0, 5], [192, 168, 0, 7], 64)
            .tcp(1449, 2111, 1000, 4096)
            .syn()
            .ack(1);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[test]
    fn test_decode_tcp() {
        let frame = tcp_frame(b"hello");
        let mp = decode(1, ts(), &frame, frame.len() as u32).unwrap().unwrap();
        assert_eq!(mp.sip, IpAddr::from([192, 168, 0, 5]));
        assert_eq!(mp.dip, IpAddr::from([192, 168, 0, 7]));
        assert_eq!(mp.protocol, PROTO_TCP);
        assert_eq!((mp.sport, mp.dport), (1449, 2111));
        assert_eq!(mp.tcp_seq, 1000);
        assert_eq!(mp.tcp_flags, SYN | ACK);
        assert_eq!(mp.payload_len, 5);
        assert_eq!(mp.payload, b"hello");
        assert_eq!(mp.packet_len, frame.len() as u32);
        assert_eq!(mp.vlan_id, 0);
        assert!(mp.validate().is_ok());
    }

    #[test]
    fn test_decode_udp_v6() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv6([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5], [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7], 64)
            .udp(5353, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 300]).unwrap();
        let mp = decode(2, ts(), &frame, frame.len() as u32).unwrap().unwrap();
        assert!(mp.sip.is_ipv6());
        assert_eq!(mp.protocol, PROTO_UDP);
        assert_eq!((mp.sport, mp.dport), (5353, 53));
        assert_eq!(mp.payload_len, 300);
        assert_eq!(mp.payload.len(), PAYLOAD_HEAD_LEN);
        assert_eq!(mp.tcp_flags, 0);
        assert!(mp.validate().is_ok());
    }

    #[test]
    fn test_decode_vlan_tagged() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .single_vlan(42)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(1000, 2000);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"x").unwrap();
        let mp = decode(3, ts(), &frame, frame.len() as u32).unwrap().unwrap();
        assert_eq!(mp.vlan_id, 42);
    }

    #[test]
    fn test_decode_non_ip_is_none() {
        // ethernet header with an ARP ethertype and a zeroed body
        let mut frame = vec![0u8; 42];
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(decode(4, ts(), &frame, 42).unwrap().is_none());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(matches!(
            decode(5, ts(), &[0u8; 4], 4),
            Err(Error::Decode { id: 5, .. })
        ));
    }
}
