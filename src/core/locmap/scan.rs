//! Range scans over the location map: the `scan_callback` primitive behind
//! replication summaries, replication responses and tombstone discard, plus
//! group enumeration for the group variant.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{clear_specific, Entry, LocMap, LocStore, Node};
use crate::core::key::{GroupedKey, StoreKey};

impl<K: StoreKey> LocMap<K> {
    /// Visit live entries with key_a in `[range_start, range_stop]`,
    /// invoking `cb(key, timestamp, length)` for each.
    ///
    /// Entries are skipped when `timestamp & reject_mask != 0`, when
    /// `require_mask` is non-zero and `timestamp & require_mask == 0`, or
    /// when `cutoff` is non-zero and `timestamp > cutoff`. The scan stops
    /// early once `max_count` entries have been visited (checked at leaf
    /// boundaries) or when `cb` returns false; either way it reports
    /// `(resume_key, true)` so the caller can continue from `resume_key`.
    /// A completed scan reports `(_, false)`.
    ///
    /// `cb` runs under a bucket read lock and must not call back into the
    /// map.
    ///
    /// Any entry observed outside its node's key range is handed back to
    /// the root and cleared from the wrong leaf, counted in
    /// `out_of_place_key_detections`.
    pub fn scan_callback<F>(
        &self,
        range_start: u64,
        range_stop: u64,
        require_mask: u64,
        reject_mask: u64,
        cutoff: u64,
        max_count: u64,
        cb: &mut F,
    ) -> (u64, bool)
    where
        F: FnMut(&K, u64, u32) -> bool,
    {
        let mut scan = Scan {
            range_start,
            range_stop,
            require_mask,
            reject_mask,
            cutoff,
            max_count,
            count: 0,
        };
        let root = self.root().clone();
        match self.scan_node(&root, &mut scan, cb) {
            Some(resume) => (resume, true),
            None => (range_stop, false),
        }
    }

    fn scan_node<F>(&self, node: &Arc<Node<K>>, scan: &mut Scan, cb: &mut F) -> Option<u64>
    where
        F: FnMut(&K, u64, u32) -> bool,
    {
        let (node_start, node_stop) = node.range();
        if node_start > scan.range_stop || node_stop < scan.range_start {
            return None;
        }
        let slots = node.snapshot();
        if let (Some(c), Some(d)) = (slots.c.clone(), slots.d.clone()) {
            if let Some(resume) = self.scan_node(&c, scan, cb) {
                return Some(resume);
            }
            return self.scan_node(&d, scan, cb);
        }
        let Some(a) = slots.a.clone() else {
            // This node's stores are mid-unsplit; the parent covers them.
            return None;
        };
        if scan.max_count > 0 && scan.count >= scan.max_count {
            return Some(node_start.max(scan.range_start));
        }
        let mut repairs: Vec<(Arc<LocStore<K>>, Entry<K>)> = Vec::new();
        let stopped = if let Some(b) = slots.b.clone() {
            self.scan_store(&b, None, node, scan, &mut repairs, cb)
                .or_else(|| self.scan_store(&a, Some(&b), node, scan, &mut repairs, cb))
        } else if let Some(e) = slots.e.clone() {
            self.scan_store(&a, None, node, scan, &mut repairs, cb)
                .or_else(|| self.scan_store(&e, Some(&a), node, scan, &mut repairs, cb))
        } else {
            self.scan_store(&a, None, node, scan, &mut repairs, cb)
        };
        for (store, entry) in repairs {
            self.out_of_place_key_detections.fetch_add(1, Ordering::Relaxed);
            self.set(
                &entry.key,
                entry.timestamp,
                entry.block_id,
                entry.offset,
                entry.length,
                false,
            );
            let bix = (entry.key.key_b() % self.bucket_count as u64) as usize;
            clear_specific(&store, bix, bix % self.lock_count, &entry);
        }
        stopped
    }

    /// Scan one leaf store. With `dedup` set, entries whose key also
    /// appears there with an equal-or-newer timestamp are skipped; the
    /// dedup store is the one scanned first for this leaf, so each key is
    /// reported once. Lock order matches the writers: the dedup store's
    /// stripe locks first.
    fn scan_store<F>(
        &self,
        s: &Arc<LocStore<K>>,
        dedup: Option<&Arc<LocStore<K>>>,
        node: &Arc<Node<K>>,
        scan: &mut Scan,
        repairs: &mut Vec<(Arc<LocStore<K>>, Entry<K>)>,
        cb: &mut F,
    ) -> Option<u64>
    where
        F: FnMut(&K, u64, u32) -> bool,
    {
        let (node_start, node_stop) = node.range();
        if s.used.load(Ordering::Acquire) <= 0 {
            return None;
        }
        for lix in 0..s.lock_count() {
            let dg = dedup.map(|d| d.stripes[lix].read());
            let sg = s.stripes[lix].read();
            for sub in 0..sg.buckets.len() {
                'entries: for e in &sg.buckets[sub] {
                    if e.block_id == 0 {
                        continue;
                    }
                    let key_a = e.key.key_a();
                    if key_a < node_start || key_a > node_stop {
                        repairs.push((s.clone(), *e));
                        continue;
                    }
                    if key_a < scan.range_start || key_a > scan.range_stop {
                        continue;
                    }
                    if e.timestamp & scan.reject_mask != 0 {
                        continue;
                    }
                    if scan.require_mask != 0 && e.timestamp & scan.require_mask == 0 {
                        continue;
                    }
                    if scan.cutoff != 0 && e.timestamp > scan.cutoff {
                        continue;
                    }
                    if let Some(dg) = &dg {
                        for de in &dg.buckets[sub] {
                            if de.block_id != 0 && de.key == e.key && de.timestamp >= e.timestamp {
                                continue 'entries;
                            }
                        }
                    }
                    scan.count += 1;
                    if !cb(&e.key, e.timestamp, e.length) {
                        return Some(key_a);
                    }
                }
            }
        }
        None
    }
}

impl<K: GroupedKey> LocMap<K> {
    /// Returns `(name_key_a, name_key_b, timestamp)` for every active child
    /// stored under the parent `(key_a, key_b)`. Children of one parent
    /// share the parent's leaf and bucket, so this reads a single chain per
    /// store.
    pub fn get_group(&self, key_a: u64, key_b: u64) -> Vec<(u64, u64, u64)> {
        let bix = (key_b % self.bucket_count as u64) as usize;
        let lix = bix % self.lock_count;
        loop {
            let (node, _, slots) = self.descend(key_a);
            let Some(a) = slots.a.clone() else {
                continue;
            };
            let used_b = slots.b.is_some();
            let (primary, fallback) = if key_a & node.left_mask == 0 {
                (a.clone(), None)
            } else if let Some(b) = slots.b.clone() {
                (b, Some(a.clone()))
            } else {
                (a.clone(), slots.e.clone())
            };
            let items = self.collect_group(&primary, fallback.as_ref(), bix, lix, key_a, key_b);
            let recheck = node.snapshot();
            if recheck.a.is_none() || recheck.d.is_some() {
                continue;
            }
            if recheck.b.is_some() != used_b {
                // A split started or finished mid-collection; retry.
                continue;
            }
            return items;
        }
    }

    fn collect_group(
        &self,
        s: &Arc<LocStore<K>>,
        fb: Option<&Arc<LocStore<K>>>,
        bix: usize,
        lix: usize,
        key_a: u64,
        key_b: u64,
    ) -> Vec<(u64, u64, u64)> {
        let sub = bix / s.lock_count();
        let mut items: Vec<(u64, u64, u64)> = Vec::new();
        let sg = s.stripes[lix].read();
        let fg = fb.map(|f| f.stripes[lix].read());
        for e in &sg.buckets[sub] {
            if e.block_id == 0 || e.key.parent() != (key_a, key_b) {
                continue;
            }
            if e.timestamp & self.inactive_mask != 0 {
                continue;
            }
            let (name_a, name_b) = e.key.name();
            items.push((name_a, name_b, e.timestamp));
        }
        if let Some(fg) = fg {
            'fallback: for e in &fg.buckets[sub] {
                if e.block_id == 0 || e.key.parent() != (key_a, key_b) {
                    continue;
                }
                if e.timestamp & self.inactive_mask != 0 {
                    continue;
                }
                let (name_a, name_b) = e.key.name();
                for item in &items {
                    if item.0 == name_a && item.1 == name_b {
                        continue 'fallback;
                    }
                }
                items.push((name_a, name_b, e.timestamp));
            }
        }
        items
    }
}

struct Scan {
    range_start: u64,
    range_stop: u64,
    require_mask: u64,
    reject_mask: u64,
    cutoff: u64,
    max_count: u64,
    count: u64,
}
