//! Flow cache: a hash map of live flows paired with an [`ExpiryQueue`] of idle deadlines.
//!
//! Every map entry owns exactly one queue node and the two structures are always mutated
//! together, so the queue front is the flow that goes idle first.

use std::{collections::HashMap, fmt, time::SystemTime};

use ahash::RandomState;

use crate::{
    queue::{ExpiryQueue, Handle},
    record::Flow,
};

struct Entry {
    flow: Flow,
    handle: Handle,
}

/// The map and queue disagree about how many flows are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desync {
    pub map_len: usize,
    pub queue_len: usize,
}

impl fmt::Display for Desync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow map (len={}) and idle queue (len={}) are out of sync",
            self.map_len, self.queue_len
        )
    }
}

pub struct FlowCache {
    flows: HashMap<u64, Entry, RandomState>,
    idle: ExpiryQueue,
    capacity: usize,
}

impl FlowCache {
    pub fn new(capacity: usize) -> Self {
        // the map grows on demand; a huge capacity should not be allocated upfront
        let initial = capacity.min(1 << 16);
        Self {
            flows: HashMap::with_capacity_and_hasher(initial, RandomState::new()),
            idle: ExpiryQueue::with_capacity(initial),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.flows.len() >= self.capacity
    }

    /// Inserts a new flow with its idle deadline. Returns false, leaving the cache untouched, if
    /// the hash is already present.
    pub fn insert(&mut self, hash: u64, flow: Flow, expiry: SystemTime) -> bool {
        if self.flows.contains_key(&hash) {
            return false;
        }
        let handle = self.idle.push_back(hash, expiry);
        self.flows.insert(hash, Entry { flow, handle });
        true
    }

    /// Replaces a flow and moves its idle deadline to the back of the queue. Returns false if
    /// the hash is absent.
    pub fn update(&mut self, hash: u64, flow: Flow, expiry: SystemTime) -> bool {
        let handle = match self.flows.get(&hash) {
            Some(entry) => entry.handle,
            None => return false,
        };
        if self.idle.remove(handle).is_none() {
            self.fatal(format_args!("flow {:#018x} has a stale queue handle", hash));
        }
        let handle = self.idle.push_back(hash, expiry);
        if let Some(entry) = self.flows.get_mut(&hash) {
            entry.handle = handle;
            entry.flow = flow;
        }
        true
    }

    /// Drops a flow from both the map and the queue.
    pub fn remove(&mut self, hash: u64) -> bool {
        self.take(hash).is_some()
    }

    /// Like [`FlowCache::remove`], handing back the stored flow.
    pub fn take(&mut self, hash: u64) -> Option<Flow> {
        let entry = self.flows.remove(&hash)?;
        if self.idle.remove(entry.handle).is_none() {
            self.fatal(format_args!("flow {:#018x} has a stale queue handle", hash));
        }
        Some(entry.flow)
    }

    pub fn fetch(&self, hash: u64) -> Option<&Flow> {
        self.flows.get(&hash).map(|e| &e.flow)
    }

    /// Evicts the flow whose idle deadline comes first.
    pub fn pop_oldest(&mut self) -> Option<Flow> {
        let (hash, _) = self.idle.pop_front()?;
        match self.flows.remove(&hash) {
            Some(entry) => Some(entry.flow),
            None => self.fatal(format_args!("queued flow {:#018x} is not in the map", hash)),
        }
    }

    /// Removes every flow whose idle deadline is at or before `now`, front to back, handing each
    /// to `on_expired`. Stops at the first deadline still in the future.
    pub fn purge<F>(&mut self, now: SystemTime, mut on_expired: F) -> usize
    where
        F: FnMut(Flow),
    {
        let mut count = 0;
        while let Some((hash, expiry)) = self.idle.front() {
            if expiry > now {
                break;
            }
            self.idle.pop_front();
            match self.flows.remove(&hash) {
                Some(entry) => on_expired(entry.flow),
                None => self.fatal(format_args!("queued flow {:#018x} is not in the map", hash)),
            }
            count += 1;
        }
        count
    }

    /// Empties the cache, returning all flows in ascending ID order.
    pub fn drain_sorted(&mut self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.drain().map(|(_, e)| e.flow).collect();
        self.idle = ExpiryQueue::new();
        flows.sort_unstable_by_key(|f| f.id);
        flows
    }

    pub fn check_sync(&self) -> Result<(), Desync> {
        if self.flows.len() == self.idle.len() {
            Ok(())
        } else {
            Err(self.desync())
        }
    }

    #[inline]
    fn desync(&self) -> Desync {
        Desync {
            map_len: self.flows.len(),
            queue_len: self.idle.len(),
        }
    }

    /// Aborts on a map/queue mismatch found mid-operation.
    #[cold]
    fn fatal(&self, detail: fmt::Arguments<'_>) -> ! {
        panic!("{}: {}", self.desync(), detail)
    }

    #[cfg(test)]
    pub(crate) fn push_orphan(&mut self, hash: u64, expiry: SystemTime) {
        self.idle.push_back(hash, expiry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::FlowKey, packet::MetaPacket, packet::PROTO_UDP};
    use std::{
        net::Ipv4Addr,
        time::{Duration, UNIX_EPOCH},
    };

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn flow(id: u64) -> (u64, Flow) {
        let mut mp = MetaPacket::new(
            at(id),
            Ipv4Addr::new(10, 0, 0, 1).into(),
            Ipv4Addr::new(10, 0, 0, 2).into(),
            PROTO_UDP,
        );
        mp.sport = id as u16;
        mp.dport = 53;
        let key = FlowKey::from_packet(&mp);
        (key.hash(), Flow::new(id, key, &mp, Duration::from_secs(1800)))
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut cache = FlowCache::new(8);
        let (h, f) = flow(1);
        assert!(cache.insert(h, f.clone(), at(10)));
        assert!(!cache.insert(h, f, at(20)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.check_sync(), Ok(()));
    }

    #[test]
    fn test_update_and_remove_absent() {
        let mut cache = FlowCache::new(8);
        let (h, f) = flow(1);
        assert!(!cache.update(h, f, at(10)));
        assert!(!cache.remove(h));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_moves_to_back() {
        let mut cache = FlowCache::new(8);
        let (h1, f1) = flow(1);
        let (h2, f2) = flow(2);
        cache.insert(h1, f1.clone(), at(10));
        cache.insert(h2, f2, at(11));
        let mut renewed = f1;
        renewed.num_packets = 2;
        assert!(cache.update(h1, renewed, at(12)));
        assert_eq!(cache.fetch(h1).map(|f| f.num_packets), Some(2));

        let oldest = cache.pop_oldest().unwrap();
        assert_eq!(oldest.id, 2);
        assert_eq!(cache.check_sync(), Ok(()));
    }

    #[test]
    fn test_purge_stops_at_first_live_entry() {
        let mut cache = FlowCache::new(8);
        for id in 1..=4 {
            let (h, f) = flow(id);
            cache.insert(h, f, at(id * 10));
        }
        let mut expired = Vec::new();
        let n = cache.purge(at(20), |f| expired.push(f.id));
        assert_eq!(n, 2);
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.check_sync(), Ok(()));
    }

    #[test]
    fn test_sync_after_mixed_operations() {
        let mut cache = FlowCache::new(64);
        for id in 0..50u64 {
            let (h, f) = flow(id);
            cache.insert(h, f.clone(), at(id));
            if id % 3 == 0 {
                cache.update(h, f, at(id + 100));
            }
            if id % 5 == 0 {
                cache.remove(h);
            }
            assert_eq!(cache.check_sync(), Ok(()));
        }
        cache.purge(at(30), |_| {});
        assert_eq!(cache.check_sync(), Ok(()));
        cache.pop_oldest();
        assert_eq!(cache.check_sync(), Ok(()));
    }

    #[test]
    fn test_drain_sorted_by_id() {
        let mut cache = FlowCache::new(8);
        for id in [5, 2, 9, 1] {
            let (h, f) = flow(id);
            cache.insert(h, f, at(100 - id));
        }
        let ids: Vec<u64> = cache.drain_sorted().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 5, 9]);
        assert!(cache.is_empty());
        assert_eq!(cache.check_sync(), Ok(()));
    }

    #[test]
    fn test_check_sync_reports_orphaned_queue_entry() {
        let mut cache = FlowCache::new(8);
        let (h, f) = flow(1);
        cache.insert(h, f, at(10));
        cache.idle.push_back(0xdead, at(20));
        assert_eq!(
            cache.check_sync(),
            Err(Desync {
                map_len: 1,
                queue_len: 2
            })
        );
    }

    #[test]
    #[should_panic(expected = "out of sync")]
    fn test_pop_oldest_panics_on_orphan() {
        let mut cache = FlowCache::new(8);
        cache.idle.push_back(0xdead, at(5));
        let (h, f) = flow(1);
        cache.insert(h, f, at(10));
        cache.pop_oldest();
    }

    #[test]
    #[should_panic(expected = "is not in the map")]
    fn test_purge_panics_on_orphan() {
        let mut cache = FlowCache::new(8);
        cache.idle.push_back(0xdead, at(5));
        cache.purge(at(10), |_| {});
    }

    #[test]
    #[should_panic(expected = "stale queue handle")]
    fn test_take_panics_on_stale_handle() {
        let mut cache = FlowCache::new(8);
        let (h, f) = flow(1);
        cache.insert(h, f, at(10));
        cache.idle.pop_front();
        cache.take(h);
    }
}
