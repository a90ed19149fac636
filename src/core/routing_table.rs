use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

use super::id::{self, Id};
use super::peer::{Peer, PeerAddress};

#[derive(Debug)]
struct KBucket {
    k: usize,
    depth: usize,            // number of prefix bits fixed to get to this bucket
    prefix: Option<Id>,      // only top `self.depth` bits are meaningful
    peers: VecDeque<Peer>,   // least-recently-seen peer is at the back
    last_refreshed: Instant, // when this bucket last saw activity
}

impl KBucket {
    fn new(k: usize, depth: usize, prefix: Option<Id>) -> Self {
        Self {
            k,
            depth,
            prefix,
            peers: VecDeque::with_capacity(k),
            last_refreshed: Instant::now(),
        }
    }

    /// Make a dummy bucket. Useful for rust ownership purposes when traversing
    /// and modifying the routing table.
    fn dummy() -> Self {
        Self {
            k: 42,
            depth: 9,
            prefix: None,
            peers: VecDeque::new(),
            last_refreshed: Instant::now(),
        }
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= self.k
    }

    /// Insert or update a peer.
    /// If it exists, its record is merged and it becomes the most recently
    /// seen entry. If the bucket is full, the least-recently-seen entry is
    /// handed back so the caller can decide whether to probe it.
    fn upsert(&mut self, peer: Peer) -> BucketInsert {
        // Any interaction with this bucket counts as activity
        self.last_refreshed = Instant::now();
        if let Some(pos) = self.peers.iter().position(|p| p.id() == peer.id()) {
            let mut existing = self.peers.remove(pos).unwrap();
            existing.merge(&peer);
            self.peers.push_front(existing);
            BucketInsert::Existed
        } else if self.is_full() {
            let lru = self.peers.back().unwrap().clone();
            BucketInsert::Full { lru }
        } else {
            self.peers.push_front(peer);
            BucketInsert::Inserted
        }
    }

    // Remove the peer with the given id if it exists.
    // Return a bool to say if the peer indeed existed and was removed.
    fn remove_peer(&mut self, peer_id: Id) -> bool {
        // Removal also counts as activity
        self.last_refreshed = Instant::now();
        if let Some(pos) = self.peers.iter().position(|p| p.id() == peer_id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Returns true if the given `id` falls within the *range of ids* this
    /// bucket covers, i.e. its first `depth` bits match the bucket prefix.
    /// This does not mean the id is one of the peers actually stored here.
    fn covers(&self, id: Id) -> bool {
        if self.depth == 0 {
            return true; // root bucket covers whole space
        }
        let prefix = self.prefix.expect("prefix must exist when depth > 0");
        id.common_prefix_len(&prefix) >= self.depth
    }

    fn find_mut(&mut self, peer_id: Id) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.id() == peer_id)
    }

    fn find(&self, peer_id: Id) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id() == peer_id)
    }
}

/// A binary tree whose leaves are K-buckets.
/// Each k-bucket contains peers with some common prefix of their ids.
#[derive(Debug)]
enum BucketTree {
    Bucket(KBucket),
    Branch {
        bit_index: usize, // which bit this branch splits on
        one: Box<BucketTree>,
        zero: Box<BucketTree>,
    },
}

/// Split a full `KBucket` into two child buckets at the next bit.
///
/// - Uses `bit_index = depth` as the split point.
/// - Creates two buckets at `depth + 1` with prefixes ending in `0` and `1`.
/// - Redistributes all peers from the original into the correct child.
///
/// Returns `(zero_child, one_child, bit_index)`.
///
/// Note: the peer that triggered the split must be inserted afterwards.
fn split_bucket(bucket: KBucket, k: usize) -> (Box<BucketTree>, Box<BucketTree>, usize) {
    let bit_index = bucket.depth; // split on the next bit
    let new_depth = bit_index + 1;

    // Build child prefixes
    let base = bucket.prefix.unwrap_or_else(Id::zero);
    let zero_prefix = Some(base.with_bit(new_depth - 1, 0));
    let one_prefix = Some(base.with_bit(new_depth - 1, 1));

    let mut zero_bucket = KBucket::new(k, new_depth, zero_prefix);
    let mut one_bucket = KBucket::new(k, new_depth, one_prefix);

    // Redistribute peers, preserving recency order
    for peer in bucket.peers.into_iter().rev() {
        if peer.id().get_bit_at(bit_index) == 0 {
            zero_bucket.upsert(peer);
        } else {
            one_bucket.upsert(peer);
        }
    }

    (
        Box::new(BucketTree::Bucket(zero_bucket)),
        Box::new(BucketTree::Bucket(one_bucket)),
        bit_index,
    )
}

#[derive(Debug, Clone)]
enum BucketInsert {
    Inserted,
    Existed,
    Full { lru: Peer },
    SplitOccurred,
}

/// Outcome of pushing a peer into the table.
#[derive(Debug, Clone)]
pub enum PushResult {
    /// The peer was not known and is now in its bucket.
    Added,
    /// The peer was already known; its record was merged and bumped to
    /// most-recently-seen.
    Existed,
    /// The target bucket is full and not splittable. The new peer is not in
    /// the table; `lru` is the entry to health-check. If that probe fails,
    /// resolve it with [`RoutingTable::resolve_probe`] to let the new peer
    /// take the slot.
    Dropped { lru: Peer },
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: Id,
    k: usize,
    tree: BucketTree,
}

impl RoutingTable {
    pub fn new(local_id: Id, k: usize) -> Self {
        // the root bucket has 0 depth and no prefix
        Self {
            local_id,
            k,
            tree: BucketTree::Bucket(KBucket::new(k, 0, None)),
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Collect every peer in the tree. Handy for tests and simple impls.
    fn all_peers(&self) -> Vec<Peer> {
        fn walk(t: &BucketTree, out: &mut Vec<Peer>) {
            match t {
                BucketTree::Bucket(b) => out.extend(b.peers.iter().cloned()),
                BucketTree::Branch { one, zero, .. } => {
                    walk(one, out);
                    walk(zero, out);
                }
            }
        }
        let mut v = Vec::new();
        walk(&self.tree, &mut v);
        v
    }

    /// Return a list of random target ids for buckets that appear stale.
    /// At most `limit` targets are returned.
    pub fn stale_bucket_targets(&self, now: Instant, ttl: Duration, limit: usize) -> Vec<Id> {
        let mut out = Vec::new();
        fn walk(t: &BucketTree, now: Instant, ttl: Duration, out: &mut Vec<Id>, limit: usize) {
            if out.len() >= limit {
                return;
            }
            match t {
                BucketTree::Bucket(b) => {
                    if now.duration_since(b.last_refreshed) >= ttl {
                        // Build a random id whose first `depth` bits match this bucket's prefix
                        out.push(id::random_with_prefix(b.prefix, b.depth));
                    }
                }
                BucketTree::Branch { zero, one, .. } => {
                    walk(zero, now, ttl, out, limit);
                    if out.len() < limit {
                        walk(one, now, ttl, out, limit);
                    }
                }
            }
        }
        walk(&self.tree, now, ttl, &mut out, limit);
        out
    }

    /// Mark the leaf bucket containing `id` as refreshed at `now`.
    pub fn mark_bucket_refreshed(&mut self, id: Id, now: Instant) {
        fn walk(t: &mut BucketTree, id: Id, now: Instant) {
            match t {
                BucketTree::Bucket(b) => {
                    b.last_refreshed = now;
                }
                BucketTree::Branch {
                    bit_index,
                    zero,
                    one,
                } => {
                    if id.get_bit_at(*bit_index) == 0 {
                        walk(zero, id, now)
                    } else {
                        walk(one, id, now)
                    }
                }
            }
        }
        walk(&mut self.tree, id, now);
    }

    pub fn contains(&self, peer_id: Id) -> bool {
        self.find(peer_id).is_some()
    }

    /// Return the total number of peers currently stored across all buckets.
    pub fn num_peers(&self) -> usize {
        fn count(t: &BucketTree) -> usize {
            match t {
                BucketTree::Bucket(b) => b.peers.len(),
                BucketTree::Branch { zero, one, .. } => count(zero) + count(one),
            }
        }
        count(&self.tree)
    }

    /// Return how many leaf k-buckets the table holds. At most `ID_BITS`,
    /// but likely far fewer.
    pub fn num_buckets(&self) -> usize {
        fn count(t: &BucketTree) -> usize {
            match t {
                BucketTree::Bucket(_) => 1,
                BucketTree::Branch { one, zero, .. } => count(zero) + count(one),
            }
        }
        count(&self.tree)
    }

    pub fn find(&self, peer_id: Id) -> Option<&Peer> {
        fn walk(t: &BucketTree, peer_id: Id) -> Option<&Peer> {
            match t {
                BucketTree::Bucket(b) => b.find(peer_id),
                BucketTree::Branch { zero, one, .. } => {
                    walk(zero, peer_id).or_else(|| walk(one, peer_id))
                }
            }
        }
        walk(&self.tree, peer_id)
    }

    pub fn find_mut(&mut self, peer_id: Id) -> Option<&mut Peer> {
        fn walk(t: &mut BucketTree, peer_id: Id) -> Option<&mut Peer> {
            match t {
                BucketTree::Bucket(b) => b.find_mut(peer_id),
                BucketTree::Branch { zero, one, .. } => {
                    if let Some(found) = walk(zero, peer_id) {
                        Some(found)
                    } else {
                        walk(one, peer_id)
                    }
                }
            }
        }
        walk(&mut self.tree, peer_id)
    }

    /// Remove a peer, e.g. once it has accumulated enough failed queries.
    pub fn pop(&mut self, peer_id: Id) -> bool {
        fn walk(t: &mut BucketTree, peer_id: Id) -> bool {
            match t {
                BucketTree::Bucket(b) => b.remove_peer(peer_id),
                BucketTree::Branch { zero, one, .. } => {
                    // Try left, else right
                    walk(zero, peer_id) || walk(one, peer_id)
                }
            }
        }
        walk(&mut self.tree, peer_id)
    }

    /// Return up to k peer addresses with the smallest XOR-distance to
    /// `target`. The local peer never appears (it is never stored).
    ///
    /// Note: we do the simple and less efficient strategy of sorting all
    /// peers. TODO: walk buckets outward from the target's prefix, stopping
    /// once k peers are collected.
    pub fn peak(&self, target: Id, k: usize) -> Vec<PeerAddress> {
        let mut peers = self.all_peers();
        peers.sort_by(|p, q| target.compare_by_distance(&p.id(), &q.id()));
        peers.truncate(k);
        peers.into_iter().map(|p| p.address).collect()
    }

    /// Insert or update a peer. The local peer's own id is never stored.
    pub fn push(&mut self, peer: Peer) -> PushResult {
        if peer.id() == self.local_id {
            return PushResult::Existed;
        }
        loop {
            match self.push_once(peer.clone()) {
                BucketInsert::SplitOccurred => {
                    // Keep looping until a split does not happen.
                    // It is possible (though extremely unlikely) that even though we
                    // split the leaf bucket, all existing peers got moved to the same
                    // new bucket, and therefore we need to continue splitting.
                    continue;
                }
                BucketInsert::Inserted => return PushResult::Added,
                BucketInsert::Existed => return PushResult::Existed,
                BucketInsert::Full { lru } => return PushResult::Dropped { lru },
            }
        }
    }

    fn push_once(&mut self, peer: Peer) -> BucketInsert {
        let peer_id = peer.id();
        let mut current = &mut self.tree;

        loop {
            match current {
                BucketTree::Bucket(_) => {
                    // We replace the current bucket with a dummy bucket for now.
                    // handle_bucket() returns the new tree to put back in place.
                    let old_bucket =
                        std::mem::replace(current, BucketTree::Bucket(KBucket::dummy()));
                    if let BucketTree::Bucket(bucket) = old_bucket {
                        let (new_tree, result) =
                            RoutingTable::handle_bucket(bucket, peer, self.local_id, self.k);
                        *current = new_tree;
                        return result;
                    } else {
                        unreachable!("old_bucket must be a KBucket");
                    }
                }
                BucketTree::Branch {
                    bit_index,
                    zero,
                    one,
                } => {
                    current = if peer_id.get_bit_at(*bit_index) == 0 {
                        zero
                    } else {
                        one
                    };
                }
            }
        }
    }

    fn handle_bucket(
        mut bucket: KBucket,
        peer: Peer,
        local_id: Id,
        k: usize,
    ) -> (BucketTree, BucketInsert) {
        let result = bucket.upsert(peer);
        match result {
            BucketInsert::Full { .. } => {
                if bucket.covers(local_id) {
                    // split the bucket
                    tracing::debug!("splitting full bucket that covers self");
                    let (zero, one, bit_index) = split_bucket(bucket, k);
                    let new_tree = BucketTree::Branch {
                        bit_index,
                        zero,
                        one,
                    };
                    (new_tree, BucketInsert::SplitOccurred)
                } else {
                    (
                        BucketTree::Bucket(bucket),
                        result, // forward the `Full` result so the caller can probe the lru
                    )
                }
            }
            _ => (BucketTree::Bucket(bucket), result),
        }
    }

    /// Settle a pending liveness probe on a bucket's least-recently-seen
    /// entry. If the old peer answered, it is bumped to most-recently-seen
    /// and the candidate that wanted its slot is forgotten. If it did not,
    /// it is evicted and the candidate takes the slot.
    pub fn resolve_probe(&mut self, lru: Peer, candidate: Peer, alive: bool) {
        if alive {
            let mut refreshed = lru;
            refreshed.record_response(Instant::now());
            let _ = self.push(refreshed);
        } else {
            self.pop(lru.id());
            let _ = self.push(candidate);
        }
    }

    /// Merge a response observation for `address` into the table: counters
    /// are updated in place when the peer is known, otherwise it is pushed
    /// as a fresh record.
    pub fn record_response(&mut self, address: &PeerAddress, now: Instant) -> PushResult {
        if let Some(peer) = self.find_mut(address.peer_id) {
            peer.record_response(now);
        }
        self.push(Peer::responded(address.clone(), now))
    }

    /// Like [`Self::record_response`] but for an incoming request.
    pub fn record_request(&mut self, address: &PeerAddress, now: Instant) -> PushResult {
        if let Some(peer) = self.find_mut(address.peer_id) {
            peer.record_request(now);
        }
        let mut peer = Peer::new(address.clone());
        peer.record_request(now);
        self.push(peer)
    }

    /// The current peer set as plain addresses, for the persistence layer.
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        self.all_peers().into_iter().map(|p| p.address).collect()
    }

    /// Re-seed a table from a snapshot. Full non-splittable buckets drop the
    /// overflow, same as live pushes.
    pub fn restore(&mut self, addresses: impl IntoIterator<Item = PeerAddress>) {
        for address in addresses {
            let _ = self.push(Peer::new(address));
        }
    }
}
