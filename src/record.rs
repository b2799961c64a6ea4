use std::{
    fmt,
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Serialize, Serializer};

use crate::{
    key::FlowKey,
    packet::{MetaPacket, FIN, RST},
};

/// Why a flow record was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    /// Session ended with terminal TCP flags. Also the value carried while the flow is active.
    Normal,
    ActiveTimeout,
    IdleTimeout,
    CaptureEnd,
    ResourceExhaustion,
}

/// A complete description of one directional session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub id: u64,
    pub key: FlowKey,
    #[serde(serialize_with = "unix_nanos")]
    pub start_time: SystemTime,
    #[serde(serialize_with = "unix_nanos")]
    pub end_time: SystemTime,
    #[serde(serialize_with = "unix_nanos")]
    pub active_timeout: SystemTime,
    pub num_packets: u64,
    pub num_bytes: u64,
    pub num_payload_bytes: u64,
    pub first_tcp_flags: u8,
    pub rest_tcp_flags: u8,
    pub first_tcp_sequence: u32,
    pub last_tcp_sequence: u32,
    pub closure_reason: ClosureReason,
    pub saw_fin_only: bool,
    #[serde(skip)]
    pub(crate) payload_seen: bool,
}

pub(crate) fn unix_nanos<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let nanos = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    s.serialize_u64(nanos as u64)
}

/// Longest span a deadline is pushed out when `start + after` does not fit in a `SystemTime`.
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

/// `start + after`, saturating to a point far beyond any capture instead of overflowing.
pub fn deadline(start: SystemTime, after: Duration) -> SystemTime {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

impl Flow {
    /// Starts a record from the first packet of a session.
    pub fn new(id: u64, key: FlowKey, mp: &MetaPacket, active_timeout: Duration) -> Self {
        Self {
            id,
            key,
            start_time: mp.timestamp,
            end_time: mp.timestamp,
            active_timeout: deadline(mp.timestamp, active_timeout),
            num_packets: 1,
            num_bytes: mp.packet_len as u64,
            num_payload_bytes: mp.payload_len as u64,
            first_tcp_flags: mp.tcp_flags,
            rest_tcp_flags: 0,
            first_tcp_sequence: mp.tcp_seq,
            last_tcp_sequence: mp.tcp_seq,
            closure_reason: ClosureReason::Normal,
            saw_fin_only: false,
            payload_seen: false,
        }
    }

    /// Folds a follow-up packet into the counters. The end time never moves backwards.
    pub fn add_packet(&mut self, mp: &MetaPacket) {
        if mp.timestamp > self.end_time {
            self.end_time = mp.timestamp;
        }
        self.num_packets += 1;
        self.num_bytes += mp.packet_len as u64;
        self.num_payload_bytes += mp.payload_len as u64;
        if mp.is_tcp() {
            self.rest_tcp_flags |= mp.tcp_flags;
            self.last_tcp_sequence = mp.tcp_seq;
        }
    }

    #[inline]
    pub fn has_fin(&self) -> bool {
        (self.first_tcp_flags | self.rest_tcp_flags) & FIN == FIN
    }

    #[inline]
    pub fn has_rst(&self) -> bool {
        (self.first_tcp_flags | self.rest_tcp_flags) & RST == RST
    }

    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self
            .start_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let end = self.end_time.duration_since(UNIX_EPOCH).unwrap_or_default();
        write!(
            f,
            "{}.{:06} - {}.{:06} ({:?}) {} (count: {}, bytes: {}, payload_bytes: {})",
            start.as_secs(),
            start.subsec_micros(),
            end.as_secs(),
            end.subsec_micros(),
            self.duration(),
            self.key,
            self.num_packets,
            self.num_bytes,
            self.num_payload_bytes
        )
    }
}

/// The leading payload bytes of a flow, handed to banner extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstPayload {
    pub ip: IpAddr,
    pub flow_id: u64,
    pub sport: u16,
    pub dport: u16,
    pub seen: SystemTime,
    pub payload: Vec<u8>,
}

impl FirstPayload {
    pub fn new(flow: &Flow, mp: &MetaPacket) -> Self {
        Self {
            ip: mp.sip,
            flow_id: flow.id,
            sport: mp.sport,
            dport: mp.dport,
            seen: mp.timestamp,
            payload: mp.payload.clone(),
        }
    }
}
