//! Kademlia routing table: 160 k-buckets indexed by the XOR-distance
//! bit-length from the local node id, each capped at [`BUCKET_SIZE`]
//! entries and evicting least-recently-seen nodes first.
//!
//! The teacher crate never implemented its own DHT (its `dht.rs` is an
//! `unimplemented!()` scaffold); this is grounded on the sibling example
//! repo `examples/Thoxy67-mainline` (`mainline`, a real BitTorrent DHT
//! crate) which lists `lru` in its dependency table for exactly this
//! "bounded bucket with recency eviction" role.

use lru::LruCache;
use std::net::SocketAddrV4;
use std::num::NonZeroUsize;

use crate::types::{Endpoint, InfoHash};

pub const BUCKET_SIZE: usize = 8;
const BUCKET_COUNT: usize = 160;

fn xor_distance(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the highest set bit in the XOR distance, i.e. which bucket a
/// remote id falls into relative to `local`. Distance 0 (self) has no
/// bucket and is rejected by the caller.
fn bucket_index(local: &[u8; 20], other: &[u8; 20]) -> Option<usize> {
    let distance = xor_distance(local, other);
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return Some(BUCKET_COUNT - 1 - (byte_idx * 8 + leading));
        }
    }
    None
}

pub struct RoutingTable {
    local_id: [u8; 20],
    buckets: Vec<LruCache<[u8; 20], SocketAddrV4>>,
}

impl RoutingTable {
    pub fn new(local_id: [u8; 20]) -> Self {
        let cap = NonZeroUsize::new(BUCKET_SIZE).unwrap();
        Self { local_id, buckets: (0..BUCKET_COUNT).map(|_| LruCache::new(cap)).collect() }
    }

    /// Inserts or refreshes a node. Returns `false` if `node_id` is our own
    /// id (nothing to do) or the node's bucket is full of more-recently-seen
    /// peers (standard Kademlia: the new node is dropped in favor of pinging
    /// the least-recent entry, which this core doesn't do automatically).
    pub fn seen(&mut self, node_id: [u8; 20], addr: SocketAddrV4) -> bool {
        let Some(idx) = bucket_index(&self.local_id, &node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if bucket.contains(&node_id) {
            bucket.put(node_id, addr);
            return true;
        }
        if bucket.len() < BUCKET_SIZE {
            bucket.put(node_id, addr);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &[u8; 20]) {
        if let Some(idx) = bucket_index(&self.local_id, node_id) {
            self.buckets[idx].pop(node_id);
        }
    }

    /// Removes whichever node is currently stored at `addr`, used when an
    /// ICMP error marks a peer unreachable (§9 Open Question 3, resolved:
    /// ICMP poisons both the uTP peer cache and the DHT routing table).
    pub fn remove_by_addr(&mut self, addr: SocketAddrV4) {
        for bucket in &mut self.buckets {
            let stale: Vec<[u8; 20]> =
                bucket.iter().filter(|(_, a)| **a == addr).map(|(id, _)| *id).collect();
            for id in stale {
                bucket.pop(&id);
            }
        }
    }

    /// The up-to-`count` nodes closest to `target`, arrival order not
    /// guaranteed to mean anything beyond "sorted by distance" (unlike the
    /// per-lookup peer callback in §5, which is explicitly arrival order).
    pub fn closest(&mut self, target: &InfoHash, count: usize) -> Vec<([u8; 20], SocketAddrV4)> {
        let mut all: Vec<([u8; 20], SocketAddrV4)> =
            self.buckets.iter().flat_map(|b| b.iter().map(|(id, addr)| (*id, *addr))).collect();
        all.sort_by_key(|(id, _)| xor_distance(id, &target.0));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(LruCache::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(ep: Endpoint) -> Self {
        ep.to_socket_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 7000)
    }

    #[test]
    fn bucket_index_is_none_for_self() {
        let id = [5u8; 20];
        assert_eq!(bucket_index(&id, &id), None);
    }

    #[test]
    fn seen_and_closest_round_trip() {
        let local = [0u8; 20];
        let mut table = RoutingTable::new(local);
        let mut far = [0u8; 20];
        far[0] = 0xFF;
        let mut near = [0u8; 20];
        near[19] = 0x01;

        assert!(table.seen(far, addr(1)));
        assert!(table.seen(near, addr(2)));

        let closest = table.closest(&InfoHash([0u8; 20]), 1);
        assert_eq!(closest[0].0, near);
    }

    #[test]
    fn bucket_eviction_caps_at_bucket_size() {
        let local = [0u8; 20];
        let mut table = RoutingTable::new(local);
        // Every id shares the same leading byte (0x80), so every distance's
        // highest set bit is byte 0 bit 7 regardless of `id[19]` — all of
        // these collide into the same bucket.
        for i in 0..(BUCKET_SIZE as u8 + 2) {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i + 1;
            table.seen(id, addr(i));
        }
        assert!(table.len() <= BUCKET_SIZE);
    }

    #[test]
    fn remove_by_addr_drops_matching_node() {
        let local = [0u8; 20];
        let mut table = RoutingTable::new(local);
        let mut id = [0u8; 20];
        id[19] = 9;
        table.seen(id, addr(9));
        assert_eq!(table.len(), 1);
        table.remove_by_addr(addr(9));
        assert_eq!(table.len(), 0);
    }
}
