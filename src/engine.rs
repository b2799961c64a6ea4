//! Flow assignment: the single-threaded state machine that turns a packet stream into completed
//! flow records.
//!
//! Per flow key a record is either absent or active. A record leaves the cache only by being
//! closed, and closing always hands it to the sink (unless the small-flow filter hides it), so no
//! key is ever terminated but still cached. A later packet with the same key starts a fresh record
//! under a new flow ID.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    cache::FlowCache,
    config::{Config, FinPolicy},
    key::FlowKey,
    packet::{suspicious_tcp_flags, MetaPacket, ACK, FIN, PROTO_TCP, RST},
    record::{deadline, ClosureReason, FirstPayload, Flow},
};

/// TCP flows with fewer packets than this are hidden by the small-flow filter.
const SMALL_FLOW_PACKETS: u64 = 4;

/// Downstream boundary for everything the engine produces.
pub trait FlowSink {
    fn emit_flow(&mut self, flow: Flow);

    fn emit_payload(&mut self, _payload: FirstPayload) {}
}

impl FlowSink for Vec<Flow> {
    fn emit_flow(&mut self, flow: Flow) {
        self.push(flow);
    }
}

/// What happened to a packet handed to [`FlowEngine::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Accepted although it lags the clock by no more than the tolerance.
    OutOfOrder,
    /// Lags the clock by more than the tolerance; nothing was mutated.
    DroppedStale,
    /// Failed input validation.
    Rejected,
    /// Dropped by the TCP flag anomaly filter.
    Suspicious,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub packets_seen: u64,
    pub packets_accepted: u64,
    pub packets_out_of_order: u64,
    pub packets_dropped_stale: u64,
    pub packets_rejected: u64,
    pub packets_suspicious: u64,
    pub flows_created: u64,
    pub flows_emitted: u64,
    pub flows_filtered: u64,
    pub closed_normal: u64,
    pub closed_active_timeout: u64,
    pub closed_idle_timeout: u64,
    pub closed_capture_end: u64,
    pub closed_resource_exhaustion: u64,
    pub evictions: u64,
    pub hash_collisions: u64,
    pub payloads: u64,
}

pub struct FlowEngine {
    cache: FlowCache,
    active_timeout: Duration,
    idle_timeout: Duration,
    ooo_tolerance: Duration,
    filter_small_flows: bool,
    filter_tcp_flags: bool,
    fin_policy: FinPolicy,
    extract_banners: bool,
    watermark: SystemTime,
    num_flows: u64,
    stats: EngineStats,
    expired: Vec<Flow>,
}

impl FlowEngine {
    pub fn new(config: &Config) -> Self {
        info!(
            "flow engine: capacity={} active_timeout={}s idle_timeout={}s ooo_tolerance={}us fin_policy={:?}",
            config.capacity,
            config.active_timeout,
            config.idle_timeout,
            config.ooo_tolerance_us,
            config.fin_policy
        );
        Self {
            cache: FlowCache::new(config.capacity),
            active_timeout: config.active_timeout(),
            idle_timeout: config.idle_timeout(),
            ooo_tolerance: config.ooo_tolerance(),
            filter_small_flows: config.filter_small_flows,
            filter_tcp_flags: config.filter_tcp_flags,
            fin_policy: config.fin_policy,
            extract_banners: config.extract_banners,
            watermark: UNIX_EPOCH,
            num_flows: 0,
            stats: EngineStats::default(),
            expired: Vec::new(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    #[inline]
    pub fn active_flows(&self) -> usize {
        self.cache.len()
    }

    #[inline]
    pub fn watermark(&self) -> SystemTime {
        self.watermark
    }

    pub fn fetch(&self, key: &FlowKey) -> Option<&Flow> {
        self.cache.fetch(key.hash()).filter(|f| f.key == *key)
    }

    /// Runs one packet to completion: clock check, idle purge, lookup, then update, termination
    /// or creation of its flow.
    pub fn process<S: FlowSink>(&mut self, mp: &MetaPacket, sink: &mut S) -> Verdict {
        self.stats.packets_seen += 1;

        if let Err(e) = mp.validate() {
            self.stats.packets_rejected += 1;
            debug!("rejected packet {}: {}", mp.id, e);
            return Verdict::Rejected;
        }
        if self.filter_tcp_flags && mp.is_tcp() && suspicious_tcp_flags(mp.tcp_flags) {
            self.stats.packets_suspicious += 1;
            debug!("dropping packet with suspicious flags {:#04x}: {}", mp.tcp_flags, mp);
            return Verdict::Suspicious;
        }

        let out_of_order = match mp.timestamp.duration_since(self.watermark) {
            Ok(_) => false,
            Err(e) if e.duration() > self.ooo_tolerance => {
                self.stats.packets_dropped_stale += 1;
                return Verdict::DroppedStale;
            }
            Err(e) => {
                debug!("out of order packet {} by {:?}", mp.id, e.duration());
                true
            }
        };

        // purge against the clock as it stood before this packet
        self.expire_idle(self.watermark, sink);
        if out_of_order {
            self.stats.packets_out_of_order += 1;
        } else {
            self.watermark = mp.timestamp;
        }
        self.stats.packets_accepted += 1;

        let key = FlowKey::from_packet(mp);
        let hash = key.hash();

        if let Some(existing) = self.cache.fetch(hash) {
            if existing.key != key {
                self.stats.hash_collisions += 1;
                warn!("hash collision between {} and {}", existing.key, key);
                if let Some(flow) = self.cache.take(hash) {
                    self.close(flow, ClosureReason::ResourceExhaustion, sink);
                }
            } else if mp.timestamp >= deadline(existing.end_time, self.idle_timeout) {
                // idle past its deadline although the purge has not reached it yet
                if let Some(flow) = self.cache.take(hash) {
                    self.close(flow, ClosureReason::IdleTimeout, sink);
                }
            } else if mp.timestamp >= existing.active_timeout {
                // the packet that trips the active timeout opens the next session
                if let Some(flow) = self.cache.take(hash) {
                    self.close(flow, ClosureReason::ActiveTimeout, sink);
                }
            } else {
                let mut flow = existing.clone();
                flow.add_packet(mp);
                self.note_fin_without_ack(&mut flow, mp);
                self.hand_off_payload(&mut flow, mp, sink);
                if self.is_terminal(&flow, mp) {
                    self.cache.remove(hash);
                    self.close(flow, ClosureReason::Normal, sink);
                } else {
                    let expiry = deadline(flow.end_time, self.idle_timeout);
                    self.cache.update(hash, flow, expiry);
                }
                return self.accepted(out_of_order);
            }
        }

        self.start_flow(key, hash, mp, sink);
        self.accepted(out_of_order)
    }

    /// Moves the clock forward by `elapsed` without a packet (an idle live capture) and closes
    /// the flows that went idle. Does nothing before the first packet set the clock.
    pub fn tick<S: FlowSink>(&mut self, elapsed: Duration, sink: &mut S) -> usize {
        if self.watermark == UNIX_EPOCH {
            return 0;
        }
        self.advance_to(deadline(self.watermark, elapsed), sink)
    }

    /// Like [`FlowEngine::tick`], but never moves the clock past `ceiling`. A live capture passes
    /// wall time less its read timeout, since packets still buffered in the kernel may be stamped
    /// earlier than the tick.
    pub fn tick_until<S: FlowSink>(
        &mut self,
        elapsed: Duration,
        ceiling: SystemTime,
        sink: &mut S,
    ) -> usize {
        if self.watermark == UNIX_EPOCH {
            return 0;
        }
        let target = deadline(self.watermark, elapsed).min(ceiling);
        self.advance_to(target, sink)
    }

    /// Moves the clock to `now` (never backwards) and closes the flows idle at that time.
    pub fn advance_to<S: FlowSink>(&mut self, now: SystemTime, sink: &mut S) -> usize {
        if now > self.watermark {
            self.watermark = now;
        }
        self.expire_idle(self.watermark, sink)
    }

    /// Closes every remaining flow with [`ClosureReason::CaptureEnd`] in ascending flow ID order
    /// and returns how many were closed.
    pub fn finalize<S: FlowSink>(&mut self, sink: &mut S) -> usize {
        self.assert_sync();
        let remaining = self.cache.drain_sorted();
        let count = remaining.len();
        for flow in remaining {
            self.close(flow, ClosureReason::CaptureEnd, sink);
        }
        info!(
            "finalized {} flows after {} packets ({} flows total)",
            count, self.stats.packets_seen, self.num_flows
        );
        count
    }

    #[inline]
    fn accepted(&self, out_of_order: bool) -> Verdict {
        if out_of_order {
            Verdict::OutOfOrder
        } else {
            Verdict::Accepted
        }
    }

    fn start_flow<S: FlowSink>(&mut self, key: FlowKey, hash: u64, mp: &MetaPacket, sink: &mut S) {
        self.num_flows += 1;
        self.stats.flows_created += 1;

        let mut flow = Flow::new(self.num_flows, key, mp, self.active_timeout);
        self.note_fin_without_ack(&mut flow, mp);
        self.hand_off_payload(&mut flow, mp, sink);

        if self.is_terminal(&flow, mp) {
            self.close(flow, ClosureReason::Normal, sink);
            return;
        }

        if self.cache.is_full() {
            self.assert_sync();
            if let Some(oldest) = self.cache.pop_oldest() {
                self.stats.evictions += 1;
                debug!("capacity alert! early close for: {}", oldest);
                self.close(oldest, ClosureReason::ResourceExhaustion, sink);
            }
        }

        let inserted = self
            .cache
            .insert(hash, flow, deadline(mp.timestamp, self.idle_timeout));
        debug_assert!(inserted, "flow {} already cached", key);
    }

    fn expire_idle<S: FlowSink>(&mut self, now: SystemTime, sink: &mut S) -> usize {
        let mut expired = std::mem::take(&mut self.expired);
        let count = self.cache.purge(now, |flow| expired.push(flow));
        for flow in expired.drain(..) {
            self.close(flow, ClosureReason::IdleTimeout, sink);
        }
        self.expired = expired;
        count
    }

    fn is_terminal(&self, flow: &Flow, mp: &MetaPacket) -> bool {
        if !mp.is_tcp() {
            return false;
        }
        match self.fin_policy {
            FinPolicy::FinOrRst => mp.tcp_flags & (FIN | RST) != 0,
            FinPolicy::FinAckOrRst => mp.has_flags(RST) || (flow.has_fin() && mp.has_flags(ACK)),
        }
    }

    #[inline]
    fn note_fin_without_ack(&self, flow: &mut Flow, mp: &MetaPacket) {
        if mp.is_tcp() && mp.has_flags(FIN) && !mp.has_flags(ACK) {
            flow.saw_fin_only = true;
        }
    }

    fn hand_off_payload<S: FlowSink>(&mut self, flow: &mut Flow, mp: &MetaPacket, sink: &mut S) {
        if !self.extract_banners || flow.payload_seen || mp.payload.is_empty() {
            return;
        }
        flow.payload_seen = true;
        self.stats.payloads += 1;
        sink.emit_payload(FirstPayload::new(flow, mp));
    }

    fn close<S: FlowSink>(&mut self, mut flow: Flow, reason: ClosureReason, sink: &mut S) {
        flow.closure_reason = reason;
        match reason {
            ClosureReason::Normal => self.stats.closed_normal += 1,
            ClosureReason::ActiveTimeout => self.stats.closed_active_timeout += 1,
            ClosureReason::IdleTimeout => self.stats.closed_idle_timeout += 1,
            ClosureReason::CaptureEnd => self.stats.closed_capture_end += 1,
            ClosureReason::ResourceExhaustion => self.stats.closed_resource_exhaustion += 1,
        }
        if self.filter_small_flows
            && reason != ClosureReason::CaptureEnd
            && flow.key.proto == PROTO_TCP
            && flow.num_packets < SMALL_FLOW_PACKETS
        {
            self.stats.flows_filtered += 1;
            return;
        }
        self.stats.flows_emitted += 1;
        sink.emit_flow(flow);
    }

    fn assert_sync(&self) {
        if let Err(desync) = self.cache.check_sync() {
            panic!(
                "{} after {} packets and {} flows",
                desync, self.stats.packets_seen, self.num_flows
            );
        }
    }
}
