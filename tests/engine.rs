use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use flowtap::{
    cache::FlowCache,
    packet::{ACK, FIN, PROTO_TCP, PROTO_UDP, RST, SYN},
    ClosureReason, Config, Flow, FlowEngine, FlowKey, MetaPacket, Verdict,
};

const A: [u8; 4] = [192, 168, 1, 10];
const B: [u8; 4] = [10, 0, 0, 80];

fn at(micros: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_000_000_000) + Duration::from_micros(micros)
}

fn secs(s: u64) -> u64 {
    s * 1_000_000
}

fn packet(micros: u64, src: [u8; 4], dst: [u8; 4], proto: u8, sport: u16, dport: u16) -> MetaPacket {
    let mut mp = MetaPacket::new(
        at(micros),
        IpAddr::from(Ipv4Addr::from(src)),
        IpAddr::from(Ipv4Addr::from(dst)),
        proto,
    );
    mp.sport = sport;
    mp.dport = dport;
    mp.packet_len = 60;
    mp
}

fn tcp(micros: u64, src: [u8; 4], dst: [u8; 4], flags: u8) -> MetaPacket {
    let (sport, dport) = if src == A { (40000, 80) } else { (80, 40000) };
    let mut mp = packet(micros, src, dst, PROTO_TCP, sport, dport);
    mp.tcp_flags = flags;
    mp
}

fn udp(micros: u64, sport: u16) -> MetaPacket {
    packet(micros, A, B, PROTO_UDP, sport, 53)
}

fn engine(config: Config) -> (FlowEngine, Vec<Flow>) {
    (FlowEngine::new(&config), Vec::new())
}

#[test]
fn test_opposite_directions_are_separate_flows() {
    let (mut engine, mut out) = engine(Config::default());
    engine.process(&tcp(0, A, B, FIN | ACK), &mut out);
    engine.process(&tcp(10, B, A, RST), &mut out);

    assert_eq!(out.len(), 2);
    assert_ne!(out[0].key, out[1].key);
    assert_eq!(out[0].key, out[1].key.reverse());
    for flow in &out {
        assert_eq!(flow.num_packets, 1);
        assert_eq!(flow.closure_reason, ClosureReason::Normal);
    }
    assert_eq!(engine.active_flows(), 0);
}

#[test]
fn test_lone_udp_packet_expires_after_idle_timeout() {
    let (mut engine, mut out) = engine(Config {
        idle_timeout: 300,
        ..Config::default()
    });
    engine.process(&udp(0, 5000), &mut out);

    assert_eq!(engine.advance_to(at(secs(299)), &mut out), 0);
    assert!(out.is_empty());
    assert_eq!(engine.advance_to(at(secs(300)), &mut out), 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].num_packets, 1);
    assert_eq!(out[0].closure_reason, ClosureReason::IdleTimeout);
    assert_eq!(engine.active_flows(), 0);
}

#[test]
fn test_fin_ack_ends_the_flow_and_a_later_rst_starts_another() {
    let (mut engine, mut out) = engine(Config::default());
    engine.process(&tcp(0, A, B, SYN), &mut out);
    engine.process(&tcp(10, A, B, ACK), &mut out);
    engine.process(&tcp(20, A, B, FIN | ACK), &mut out);

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, 1);
    assert_eq!(out[0].num_packets, 3);
    assert_eq!(out[0].closure_reason, ClosureReason::Normal);
    assert!(!out[0].saw_fin_only);

    // the emitted record is never touched again
    engine.process(&tcp(30, A, B, RST), &mut out);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].num_packets, 3);
    assert_eq!(out[1].id, 2);
    assert_eq!(out[1].num_packets, 1);
    assert_eq!(out[1].key, out[0].key);
}

#[test]
fn test_capacity_evicts_oldest_idle_flow() {
    let (mut engine, mut out) = engine(Config {
        capacity: 3,
        ..Config::default()
    });
    for (i, sport) in [1001, 1002, 1003].iter().enumerate() {
        engine.process(&udp(i as u64, *sport), &mut out);
    }
    // refresh the first flow so the second becomes the oldest
    engine.process(&udp(10, 1001), &mut out);
    assert!(out.is_empty());
    assert_eq!(engine.active_flows(), 3);

    engine.process(&udp(20, 1004), &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key.sport, 1002);
    assert_eq!(out[0].closure_reason, ClosureReason::ResourceExhaustion);
    assert_eq!(engine.active_flows(), 3);
    assert_eq!(engine.stats().evictions, 1);
}

#[test]
fn test_out_of_order_tolerance() {
    let (mut engine, mut out) = engine(Config::default());
    let key = FlowKey::from_packet(&udp(0, 5000));

    assert_eq!(engine.process(&udp(10, 5000), &mut out), Verdict::Accepted);
    assert_eq!(engine.process(&udp(6, 5000), &mut out), Verdict::OutOfOrder);
    let flow = engine.fetch(&key).unwrap().clone();
    assert_eq!(flow.num_packets, 2);
    assert_eq!(flow.end_time, at(10));
    assert_eq!(engine.watermark(), at(10));

    assert_eq!(engine.process(&udp(4, 5000), &mut out), Verdict::DroppedStale);
    assert_eq!(engine.fetch(&key), Some(&flow));
    assert_eq!(engine.stats().packets_dropped_stale, 1);
    assert_eq!(engine.stats().packets_out_of_order, 1);
    assert!(out.is_empty());
}

#[test]
fn test_small_flow_filter_hides_short_tcp_flows() {
    let (mut engine, mut out) = engine(Config {
        filter_small_flows: true,
        ..Config::default()
    });
    engine.process(&tcp(0, A, B, SYN), &mut out);
    engine.process(&tcp(10, A, B, FIN | ACK), &mut out);

    assert!(out.is_empty());
    assert_eq!(engine.active_flows(), 0);
    assert_eq!(engine.stats().flows_created, 1);
    assert_eq!(engine.stats().flows_filtered, 1);
    assert_eq!(engine.stats().closed_normal, 1);
}

#[test]
fn test_active_timeout_splits_long_flows() {
    let (mut engine, mut out) = engine(Config {
        active_timeout: 10,
        ..Config::default()
    });
    engine.process(&udp(0, 5000), &mut out);
    engine.process(&udp(secs(5), 5000), &mut out);
    engine.process(&udp(secs(10), 5000), &mut out);

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].num_packets, 2);
    assert_eq!(out[0].closure_reason, ClosureReason::ActiveTimeout);
    let key = out[0].key;
    let next = engine.fetch(&key).unwrap();
    assert_eq!(next.id, 2);
    assert_eq!(next.num_packets, 1);
    assert_eq!(next.start_time, at(secs(10)));
}

#[test]
fn test_idle_purge_uses_clock_before_the_packet() {
    let (mut engine, mut out) = engine(Config {
        idle_timeout: 300,
        ..Config::default()
    });
    engine.process(&udp(0, 5000), &mut out);
    engine.process(&udp(secs(301), 5001), &mut out);
    assert!(out.is_empty());
    engine.process(&udp(secs(302), 5002), &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key.sport, 5000);
    assert_eq!(out[0].closure_reason, ClosureReason::IdleTimeout);
}

#[test]
fn test_vlan_is_part_of_the_key() {
    let (mut engine, mut out) = engine(Config::default());
    let plain = udp(0, 5000);
    let mut tagged = udp(1, 5000);
    tagged.vlan_id = 7;
    engine.process(&plain, &mut out);
    engine.process(&tagged, &mut out);
    assert_eq!(engine.active_flows(), 2);
}

#[test]
fn test_finalize_emits_everything_in_id_order() {
    let (mut engine, mut out) = engine(Config::default());
    for i in 0..50u16 {
        engine.process(&udp(i as u64 * 3, 6000 + (i % 20)), &mut out);
    }
    engine.process(&tcp(200, A, B, SYN), &mut out);
    assert!(out.is_empty());

    let remaining = engine.active_flows();
    assert_eq!(remaining, 21);
    assert_eq!(engine.finalize(&mut out), remaining);
    assert_eq!(out.len(), remaining);
    assert_eq!(engine.active_flows(), 0);
    assert!(out.windows(2).all(|w| w[0].id < w[1].id));
    assert!(out
        .iter()
        .all(|f| f.closure_reason == ClosureReason::CaptureEnd));
    assert_eq!(out.iter().map(|f| f.num_packets).sum::<u64>(), 51);
}

#[test]
fn test_finalize_ignores_small_flow_filter() {
    let (mut engine, mut out) = engine(Config {
        filter_small_flows: true,
        ..Config::default()
    });
    engine.process(&tcp(0, A, B, SYN), &mut out);
    assert_eq!(engine.finalize(&mut out), 1);
    assert_eq!(out.len(), 1);
}

#[test]
fn test_ids_monotonic_and_capacity_bounded() {
    let capacity = 8;
    let (mut engine, mut out) = engine(Config {
        capacity,
        idle_timeout: 1,
        ..Config::default()
    });
    let mut t = 0;
    for round in 0..200u64 {
        let sport = 1000 + (round * 7 % 23) as u16;
        t += 37_000;
        let mut mp = udp(t, sport);
        if round % 5 == 0 {
            mp = tcp(t, A, B, if round % 10 == 0 { FIN } else { SYN });
        }
        engine.process(&mp, &mut out);
        assert!(engine.active_flows() <= capacity);
    }
    engine.finalize(&mut out);

    let stats = engine.stats();
    assert_eq!(stats.flows_created, stats.flows_emitted);
    assert_eq!(out.len() as u64, stats.flows_created);
    let ids: HashSet<u64> = out.iter().map(|f| f.id).collect();
    assert_eq!(ids.len(), out.len());
    assert_eq!(ids.iter().max().copied(), Some(stats.flows_created));
    for flow in &out {
        assert!(flow.end_time >= flow.start_time);
    }
}

#[test]
fn test_cache_stays_in_sync() {
    let mut cache = FlowCache::new(4);
    let mp = udp(0, 1);
    let key = FlowKey::from_packet(&mp);
    let flow = |id| Flow::new(id, key, &mp, Duration::from_secs(60));

    for hash in 0..4u64 {
        assert!(cache.insert(hash, flow(hash + 1), at(hash)));
    }
    assert!(cache.is_full());
    assert!(cache.update(1, flow(2), at(100)));
    assert!(cache.remove(2));
    assert_eq!(cache.pop_oldest().map(|f| f.id), Some(1));
    assert_eq!(cache.purge(at(50), |_| ()), 1);
    assert_eq!(cache.len(), 1);
    assert!(cache.check_sync().is_ok());
    assert_eq!(cache.drain_sorted().len(), 1);
    assert!(cache.check_sync().is_ok());
}
