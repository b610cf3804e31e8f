//! # Distance-routed peer table
//!
//! This node's view of the overlay: live, authenticated peers organized
//! into XOR-distance buckets. Bucket `i` holds peers whose distance `d`
//! from this node satisfies `161 - floor(log2(d)) == i`, so higher
//! indices are closer peers.
//!
//! ## Ordering
//!
//! Within a bucket, entries are ordered by a composite priority computed
//! from their peer records: the mean of within-table percentile ranks of
//! data provided, payment received, identity rank, uptime, inverse
//! latency and bandwidth, minus a penalty for NAT-restricted peers when
//! this node itself is unrestricted. The score is recomputed when a
//! bucket is consulted, never maintained incrementally; raising any
//! single counter can only raise the score.
//!
//! Eviction: a full bucket only admits a new entry that outscores its
//! current lowest-priority member.

use std::net::SocketAddr;

use tracing::trace;

use crate::identity::{bucket_index, distance_cmp, NodeId, MAX_BUCKET_INDEX};
use crate::peers::PeerRecord;

/// Default bucket width (entries per bucket).
pub const DEFAULT_BUCKET_WIDTH: usize = 20;

/// Bucket slots allocated. Indices 2..=161 are reachable from the
/// distance formula; the low slots stay empty.
const BUCKET_SLOTS: usize = MAX_BUCKET_INDEX + 1;

/// One live peer in the table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub record: PeerRecord,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    /// Whether this node itself is NAT-restricted; feeds the pairing
    /// penalty in the priority score.
    self_behind_nat: bool,
    bucket_width: usize,
    buckets: Vec<Vec<RouteEntry>>,
    len: usize,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, bucket_width: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_SLOTS);
        for _ in 0..BUCKET_SLOTS {
            buckets.push(Vec::new());
        }
        Self {
            self_id,
            self_behind_nat: false,
            bucket_width: bucket_width.max(1),
            buckets,
            len: 0,
        }
    }

    pub fn set_self_behind_nat(&mut self, behind: bool) {
        self.self_behind_nat = behind;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<&RouteEntry> {
        let idx = bucket_index(&self.self_id, id)?;
        self.buckets[idx].iter().find(|e| e.id == *id)
    }

    /// Insert or refresh a peer. Returns false when the entry was
    /// rejected: it is this node itself, or its bucket is full of
    /// higher-priority peers.
    pub fn insert(&mut self, entry: RouteEntry) -> bool {
        let Some(idx) = bucket_index(&self.self_id, &entry.id) else {
            return false;
        };

        if let Some(existing) = self.buckets[idx].iter_mut().find(|e| e.id == entry.id) {
            existing.endpoint = entry.endpoint;
            existing.record = entry.record;
            return true;
        }

        if self.buckets[idx].len() < self.bucket_width {
            self.buckets[idx].push(entry);
            self.len += 1;
            return true;
        }

        // Full: the newcomer must outscore the current weakest member.
        self.sort_bucket(idx);
        let new_score = self.priority(&entry);
        let weakest = self.buckets[idx]
            .last()
            .map(|e| self.priority(e))
            .unwrap_or(f64::MIN);
        if new_score > weakest {
            trace!(
                bucket = idx,
                id = %entry.id,
                "evicting lowest-priority entry for newcomer"
            );
            self.buckets[idx].pop();
            self.buckets[idx].push(entry);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.self_id, id) else {
            return false;
        };
        if let Some(pos) = self.buckets[idx].iter().position(|e| e.id == *id) {
            self.buckets[idx].remove(pos);
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Refresh the stored record for a peer already in the table.
    pub fn update_record(&mut self, id: &NodeId, record: PeerRecord) {
        if let Some(idx) = bucket_index(&self.self_id, id) {
            if let Some(entry) = self.buckets[idx].iter_mut().find(|e| e.id == *id) {
                entry.record = record;
            }
        }
    }

    /// Consult one bucket: sorted by descending priority.
    pub fn bucket_sorted(&mut self, idx: usize) -> &[RouteEntry] {
        self.sort_bucket(idx);
        &self.buckets[idx]
    }

    /// The `n` entries closest to `target`, optionally no farther from it
    /// than `limit` is. Scans outward from the bucket that would contain
    /// the target, then orders the candidates globally by distance.
    pub fn closest(&mut self, target: &NodeId, n: usize, limit: Option<&NodeId>) -> Vec<RouteEntry> {
        if n == 0 || self.len == 0 {
            return Vec::new();
        }

        let start = bucket_index(&self.self_id, target).unwrap_or(MAX_BUCKET_INDEX);
        let mut order: Vec<usize> = Vec::with_capacity(BUCKET_SLOTS);
        order.push(start);
        for step in 1..BUCKET_SLOTS {
            if start + step < BUCKET_SLOTS {
                order.push(start + step);
            }
            if step <= start {
                order.push(start - step);
            }
        }

        let limit_dist = limit.map(|l| l.xor_distance(target));
        let mut candidates: Vec<RouteEntry> = Vec::new();
        for idx in order {
            if self.buckets[idx].is_empty() {
                continue;
            }
            self.sort_bucket(idx);
            for entry in &self.buckets[idx] {
                let dist = entry.id.xor_distance(target);
                if let Some(limit_dist) = &limit_dist {
                    if distance_cmp(&dist, limit_dist) == std::cmp::Ordering::Greater {
                        continue;
                    }
                }
                candidates.push(entry.clone());
            }
        }

        candidates.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db)
        });
        candidates.truncate(n);
        candidates
    }

    /// All entries, unordered. Used to seed lookups and for tests.
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.buckets.iter().flatten()
    }

    fn sort_bucket(&mut self, idx: usize) {
        if self.buckets[idx].len() < 2 {
            return;
        }
        let scored: Vec<(f64, usize)> = self.buckets[idx]
            .iter()
            .enumerate()
            .map(|(i, e)| (self.priority(e), i))
            .collect();
        let mut order: Vec<usize> = (0..self.buckets[idx].len()).collect();
        let self_id = self.self_id;
        let bucket = &self.buckets[idx];
        order.sort_by(|&a, &b| {
            let (sa, sb) = (scored[a].0, scored[b].0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let da = bucket[a].id.xor_distance(&self_id);
                    let db = bucket[b].id.xor_distance(&self_id);
                    distance_cmp(&da, &db)
                })
                .then_with(|| bucket[a].id.cmp(&bucket[b].id))
        });
        let reordered: Vec<RouteEntry> = order.iter().map(|&i| bucket[i].clone()).collect();
        self.buckets[idx] = reordered;
    }

    /// Composite priority: mean of per-metric percentile ranks minus the
    /// NAT pairing penalty. Each percentile is the share of the
    /// population (table entries plus the scored entry itself) whose
    /// value the entry's is at least as good as, so every metric
    /// contributes monotonically.
    pub fn priority(&self, entry: &RouteEntry) -> f64 {
        // A candidate not yet in the table joins the population for its
        // own score; it trivially satisfies its own predicate.
        let outsider = usize::from(!self.contains(&entry.id));
        let total = (self.len + outsider).max(1) as f64;
        let r = &entry.record;

        let pct_ge = |extract: &dyn Fn(&PeerRecord) -> u64, value: u64| -> f64 {
            let at_or_below = self
                .entries()
                .filter(|e| extract(&e.record) <= value)
                .count();
            (at_or_below + outsider) as f64 / total
        };
        // Lower latency is better: rank against peers at or above ours.
        let latency_pct = {
            let at_or_above = self
                .entries()
                .filter(|e| e.record.latency_ms >= r.latency_ms)
                .count();
            (at_or_above + outsider) as f64 / total
        };

        let mut score = (pct_ge(&|p| p.data_provided, r.data_provided)
            + pct_ge(&|p| p.payment_received, r.payment_received)
            + pct_ge(&|p| u64::from(p.rank), u64::from(r.rank))
            + pct_ge(&|p| p.uptime_secs, r.uptime_secs)
            + pct_ge(&|p| p.bandwidth, r.bandwidth)
            + latency_pct)
            / 6.0;

        if r.behind_nat && !self.self_behind_nat {
            score -= 1.0 / 7.0;
        }
        score
    }
}
