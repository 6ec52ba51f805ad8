//! Concurrent location index: a partitioned trie over the high bits of
//! key_a with a lock-striped hash leaf at each tip.
//!
//! Each node owns up to five slots: `a` is the primary leaf store, `b` the
//! destination while a split is in progress, `c`/`d` the child nodes once a
//! split completes, and `e` the right-half fallback while an unsplit merges
//! it back into `a`. Readers and writers snapshot the slots, operate on the
//! stores they selected, then re-examine the slots to detect a resize that
//! completed mid-operation and retry from the root when one did.
//!
//! CONCURRENCY ASSUMPTION: all reads and writes active at the start of or
//! during one resize of a key range complete before another resize of the
//! same range starts. Background resize tasks hold a per-node `resizing`
//! flag so two resizes of the same node cannot overlap, and the scan paths
//! detect and repair the out-of-place keys a violated assumption would
//! leave behind, counting them in `out_of_place_key_detections`.

mod scan;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::constants::{DEFAULT_LOCMAP_PAGE_SIZE, DEFAULT_LOCMAP_SPLIT_MULTIPLIER, TSB_INACTIVE};
use crate::core::key::StoreKey;

/// One key's location: where the newest copy lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Loc {
    pub timestamp: u64,
    pub block_id: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Copy, Clone)]
struct Entry<K: StoreKey> {
    key: K,
    timestamp: u64,
    block_id: u32,
    offset: u32,
    length: u32,
}

impl<K: StoreKey> Entry<K> {
    #[inline]
    fn loc(&self) -> Loc {
        Loc {
            timestamp: self.timestamp,
            block_id: self.block_id,
            offset: self.offset,
            length: self.length,
        }
    }
}

struct Stripe<K: StoreKey> {
    // buckets[sub] holds bucket index sub * lock_count + stripe_index
    buckets: Vec<Vec<Entry<K>>>,
}

/// A leaf store: a fixed bucket array striped across `lock_count` rw-locks.
/// Bucket index is `key_b % bucket_count`; a slot with `block_id == 0` is
/// free. `used` counts live entries.
pub(crate) struct LocStore<K: StoreKey> {
    stripes: Vec<CachePadded<RwLock<Stripe<K>>>>,
    bucket_count: usize,
    used: AtomicI64,
}

impl<K: StoreKey> LocStore<K> {
    fn new(bucket_count: usize, lock_count: usize) -> Self {
        let stripes = (0..lock_count)
            .map(|lix| {
                let n = (bucket_count + lock_count - 1 - lix) / lock_count;
                CachePadded::new(RwLock::new(Stripe {
                    buckets: vec![Vec::new(); n],
                }))
            })
            .collect();
        Self {
            stripes,
            bucket_count,
            used: AtomicI64::new(0),
        }
    }

    #[inline]
    fn lock_count(&self) -> usize {
        self.stripes.len()
    }
}

#[derive(Clone)]
struct Slots<K: StoreKey> {
    a: Option<Arc<LocStore<K>>>,
    b: Option<Arc<LocStore<K>>>,
    c: Option<Arc<Node<K>>>,
    d: Option<Arc<Node<K>>>,
    e: Option<Arc<LocStore<K>>>,
}

impl<K: StoreKey> Slots<K> {
    fn empty() -> Self {
        Self {
            a: None,
            b: None,
            c: None,
            d: None,
            e: None,
        }
    }
}

pub(crate) struct Node<K: StoreKey> {
    left_mask: u64,
    range_start: u64,
    range_stop: u64,
    slots: RwLock<Slots<K>>,
    resizing: Mutex<bool>,
}

/// Tuning for the location map.
#[derive(Debug, Clone)]
pub struct LocMapConfig {
    /// Lock stripes per leaf and workers per resize migration.
    pub cores: usize,
    /// Bytes per leaf page; bucket count is `page_size / entry_size`.
    pub page_size: usize,
    /// A leaf splits when `used > bucket_count * split_multiplier`.
    pub split_multiplier: f64,
}

impl Default for LocMapConfig {
    fn default() -> Self {
        Self {
            cores: num_cpus::get().max(1),
            page_size: DEFAULT_LOCMAP_PAGE_SIZE,
            split_multiplier: DEFAULT_LOCMAP_SPLIT_MULTIPLIER,
        }
    }
}

pub struct LocMap<K: StoreKey> {
    root: Arc<Node<K>>,
    cores: usize,
    split_count: i64,
    bucket_count: usize,
    lock_count: usize,
    inactive_mask: u64,
    out_of_place_key_detections: AtomicU64,
}

impl<K: StoreKey> LocMap<K> {
    pub fn new(cfg: LocMapConfig) -> Self {
        let entry_size = std::mem::size_of::<Entry<K>>();
        let bucket_count = (cfg.page_size / entry_size).max(1);
        let lock_count = cfg.cores.clamp(1, bucket_count);
        let split_multiplier = if cfg.split_multiplier > 0.0 {
            cfg.split_multiplier
        } else {
            DEFAULT_LOCMAP_SPLIT_MULTIPLIER
        };
        let root = Arc::new(Node {
            left_mask: 1 << 63,
            range_start: 0,
            range_stop: u64::MAX,
            slots: RwLock::new(Slots {
                a: Some(Arc::new(LocStore::new(bucket_count, lock_count))),
                ..Slots::empty()
            }),
            resizing: Mutex::new(false),
        });
        Self {
            root,
            cores: cfg.cores.max(1),
            split_count: (bucket_count as f64 * split_multiplier) as i64,
            bucket_count,
            lock_count,
            inactive_mask: TSB_INACTIVE,
            out_of_place_key_detections: AtomicU64::new(0),
        }
    }

    pub fn out_of_place_key_detections(&self) -> u64 {
        self.out_of_place_key_detections.load(Ordering::Relaxed)
    }

    #[inline]
    fn bucket_index(&self, key: &K) -> (usize, usize) {
        let bix = (key.key_b() % self.bucket_count as u64) as usize;
        (bix, bix % self.lock_count)
    }

    /// Descend to the leaf-bearing node for `key_a`, returning it, its
    /// parent (if any) and a slot snapshot taken at the leaf.
    fn descend(&self, key_a: u64) -> (Arc<Node<K>>, Option<Arc<Node<K>>>, Slots<K>) {
        let mut prev: Option<Arc<Node<K>>> = None;
        let mut node = self.root.clone();
        loop {
            let slots = node.slots.read().clone();
            match (slots.c.clone(), slots.d.clone()) {
                (Some(c), Some(d)) => {
                    let next = if key_a & node.left_mask == 0 { c } else { d };
                    prev = Some(node);
                    node = next;
                }
                _ => return (node, prev, slots),
            }
        }
    }

    /// Returns the location for `key`, or an all-zero `Loc` when absent.
    pub fn get(&self, key: &K) -> Loc {
        let (bix, lix) = self.bucket_index(key);
        loop {
            let (node, _, slots) = self.descend(key.key_a());
            let Some(a) = slots.a.clone() else {
                // An unsplit claimed this node's stores mid-descent.
                continue;
            };
            if key.key_a() & node.left_mask == 0 {
                let found = search(&a, None, bix, lix, key);
                if node.slots.read().a.is_none() {
                    continue;
                }
                return found;
            }
            if let Some(b) = slots.b {
                // Split in progress: b first, falling back to a.
                return search(&b, Some(&a), bix, lix, key);
            }
            let found = search(&a, slots.e.as_ref(), bix, lix, key);
            let recheck = node.slots.read().clone();
            if recheck.a.is_none() {
                continue;
            }
            if let Some(b) = recheck.b {
                // A split started while we were reading.
                return search(&b, Some(&a), bix, lix, key);
            }
            if recheck.d.is_some() {
                // A split completed while we were reading.
                continue;
            }
            return found;
        }
    }

    /// Stores `loc` for `key` if `loc.timestamp` is newer than what is held
    /// (or equal, when `even_if_same_timestamp` is set), returning the
    /// previously held timestamp either way. A winning `block_id == 0`
    /// removes the key from the index.
    pub fn set(
        &self,
        key: &K,
        timestamp: u64,
        block_id: u32,
        offset: u32,
        length: u32,
        even_if_same_timestamp: bool,
    ) -> u64 {
        let (bix, lix) = self.bucket_index(key);
        let entry = Entry {
            key: *key,
            timestamp,
            block_id,
            offset,
            length,
        };
        let mut original_old: Option<u64> = None;
        let finish = |old: u64, original: Option<u64>| match original {
            Some(orig) if orig < old => orig,
            _ => old,
        };
        loop {
            let (node, prev, slots) = self.descend(key.key_a());
            let Some(a) = slots.a.clone() else {
                continue;
            };
            let won = |old: u64| timestamp > old || (even_if_same_timestamp && timestamp == old);
            if key.key_a() & node.left_mask == 0 {
                let old = set_in(&a, None, bix, lix, &entry, even_if_same_timestamp);
                if won(old) {
                    let recheck = node.slots.read().clone();
                    if recheck.a.is_none() {
                        // Unsplit finished under us; undo and retry.
                        clear_specific(&a, bix, lix, &entry);
                        original_old.get_or_insert(old);
                        continue;
                    }
                    if recheck.b.is_none() && recheck.e.is_none() {
                        self.maybe_resize(&node, prev.as_ref(), &a);
                    }
                }
                return finish(old, original_old);
            }
            if let Some(b) = slots.b {
                let old = set_in(&b, Some(&a), bix, lix, &entry, even_if_same_timestamp);
                return finish(old, original_old);
            }
            let old = set_in(&a, slots.e.as_ref(), bix, lix, &entry, even_if_same_timestamp);
            if won(old) {
                let recheck = node.slots.read().clone();
                if recheck.a.is_none() {
                    clear_specific(&a, bix, lix, &entry);
                    original_old.get_or_insert(old);
                    continue;
                }
                if let Some(b) = recheck.b {
                    // A split started while we were writing; rewrite into b
                    // (our own write in a is at least the competing value).
                    original_old.get_or_insert(old);
                    let old2 = set_in(&b, Some(&a), bix, lix, &entry, even_if_same_timestamp);
                    return finish(old2, original_old);
                }
                if recheck.d.is_some() {
                    // A split completed while we were writing.
                    clear_specific(&a, bix, lix, &entry);
                    original_old.get_or_insert(old);
                    continue;
                }
                if recheck.e.is_none() {
                    self.maybe_resize(&node, prev.as_ref(), &a);
                }
            }
            return finish(old, original_old);
        }
    }

    fn maybe_resize(&self, node: &Arc<Node<K>>, prev: Option<&Arc<Node<K>>>, a: &Arc<LocStore<K>>) {
        let used = a.used.load(Ordering::Acquire);
        if used > self.split_count {
            let node = node.clone();
            let cores = self.cores;
            let split_count = self.split_count;
            thread::spawn(move || node.split(cores, split_count));
        } else if used == 0 {
            if let Some(prev) = prev {
                let prev = prev.clone();
                let cores = self.cores;
                thread::spawn(move || prev.unsplit(cores));
            }
        }
    }

    fn root(&self) -> &Arc<Node<K>> {
        &self.root
    }
}

/// Look `key` up in `s`, falling back to `fb`. Read locks are taken in
/// (s, fb) order, matching every writer.
fn search<K: StoreKey>(
    s: &Arc<LocStore<K>>,
    fb: Option<&Arc<LocStore<K>>>,
    bix: usize,
    lix: usize,
    key: &K,
) -> Loc {
    let sub = bix / s.lock_count();
    let sg = s.stripes[lix].read();
    let fg = fb.map(|f| f.stripes[lix].read());
    for e in &sg.buckets[sub] {
        if e.block_id != 0 && e.key == *key {
            return e.loc();
        }
    }
    if let Some(fg) = fg {
        for e in &fg.buckets[sub] {
            if e.block_id != 0 && e.key == *key {
                return e.loc();
            }
        }
    }
    Loc::default()
}

/// The merge-write at the heart of `set`. When both a primary match and a
/// fallback match exist, the two merge in place: the higher timestamp wins
/// and the fallback copy is cleared. Write locks are taken in (s, fb)
/// order; split migration locks (b, a) and unsplit migration (a, e), so
/// every path agrees on order for any given pair.
fn set_in<K: StoreKey>(
    s: &Arc<LocStore<K>>,
    fb: Option<&Arc<LocStore<K>>>,
    bix: usize,
    lix: usize,
    entry: &Entry<K>,
    even_if_same_timestamp: bool,
) -> u64 {
    let sub = bix / s.lock_count();
    let mut sg = s.stripes[lix].write();
    let mut fg = fb.map(|f| f.stripes[lix].write());

    let mut s_match: Option<usize> = None;
    let mut s_unused: Option<usize> = None;
    for (i, e) in sg.buckets[sub].iter().enumerate() {
        if e.block_id == 0 {
            if s_unused.is_none() {
                s_unused = Some(i);
            }
            continue;
        }
        if e.key == entry.key {
            s_match = Some(i);
            break;
        }
    }
    let mut fb_match: Option<Entry<K>> = None;
    if let (Some(fg), Some(fb_store)) = (fg.as_mut(), fb) {
        for e in fg.buckets[sub].iter_mut() {
            if e.block_id != 0 && e.key == entry.key {
                fb_match = Some(*e);
                // The fallback copy is always superseded by whatever the
                // merge leaves in the primary.
                e.block_id = 0;
                fb_store.used.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
    }

    let won = |old: u64| entry.timestamp > old || (even_if_same_timestamp && entry.timestamp == old);

    match s_match {
        Some(si) => {
            let current = sg.buckets[sub][si];
            let (old, winner) = match fb_match {
                Some(fe) if fe.timestamp > current.timestamp => {
                    let old = fe.timestamp;
                    (old, if won(old) { *entry } else { fe })
                }
                _ => {
                    let old = current.timestamp;
                    (old, if won(old) { *entry } else { current })
                }
            };
            sg.buckets[sub][si] = winner;
            if winner.block_id == 0 {
                s.used.fetch_sub(1, Ordering::AcqRel);
            }
            old
        }
        None => {
            let (old, winner) = match fb_match {
                Some(fe) => {
                    let old = fe.timestamp;
                    (old, if won(old) { *entry } else { fe })
                }
                None => (0, *entry),
            };
            if !won(old) && fb_match.is_none() {
                return old;
            }
            if winner.block_id != 0 {
                s.used.fetch_add(1, Ordering::AcqRel);
                match s_unused {
                    Some(i) => sg.buckets[sub][i] = winner,
                    None => sg.buckets[sub].push(winner),
                }
            }
            old
        }
    }
}

/// Undo a write that landed in a store abandoned by a completed resize:
/// clear the entry only if it still holds exactly what we wrote.
fn clear_specific<K: StoreKey>(s: &Arc<LocStore<K>>, bix: usize, lix: usize, entry: &Entry<K>) {
    let sub = bix / s.lock_count();
    let mut sg = s.stripes[lix].write();
    for e in sg.buckets[sub].iter_mut() {
        if e.block_id == 0 {
            continue;
        }
        if e.key == entry.key {
            if e.timestamp == entry.timestamp
                && e.block_id == entry.block_id
                && e.offset == entry.offset
                && e.length == entry.length
            {
                e.block_id = 0;
                s.used.fetch_sub(1, Ordering::AcqRel);
            }
            break;
        }
    }
}

impl<K: StoreKey> Node<K> {
    fn range(&self) -> (u64, u64) {
        (self.range_start, self.range_stop)
    }

    fn snapshot(&self) -> Slots<K> {
        self.slots.read().clone()
    }

    /// Split this leaf's right half into a fresh store and publish two
    /// child nodes. Runs as a background task.
    fn split(self: Arc<Self>, cores: usize, split_count: i64) {
        let a = {
            let mut resizing = self.resizing.lock();
            let slots = self.slots.read().clone();
            let Some(a) = slots.a else { return };
            if *resizing || slots.c.is_some() || a.used.load(Ordering::Acquire) <= split_count {
                return;
            }
            *resizing = true;
            a
        };
        let b = Arc::new(LocStore::new(a.bucket_count, a.lock_count()));
        self.slots.write().b = Some(b.clone());

        // Phase one copies right-half entries into b until a full pass
        // copies nothing; phase two copies and clears until quiescent. Two
        // passes minimum each, since writers race the migration.
        let mut passes = 0;
        loop {
            let (copies, _) = migrate(&a, &b, cores, Some(self.left_mask), false);
            passes += 1;
            if passes >= 2 && copies == 0 {
                break;
            }
        }
        passes = 0;
        loop {
            let (copies, clears) = migrate(&a, &b, cores, Some(self.left_mask), true);
            passes += 1;
            if passes >= 2 && copies == 0 && clears == 0 {
                break;
            }
        }

        let c = Arc::new(Node {
            left_mask: self.left_mask >> 1,
            range_start: self.range_start,
            range_stop: self.range_stop - self.left_mask,
            slots: RwLock::new(Slots {
                a: Some(a),
                ..Slots::empty()
            }),
            resizing: Mutex::new(false),
        });
        let d = Arc::new(Node {
            left_mask: self.left_mask >> 1,
            range_start: self.range_start + self.left_mask,
            range_stop: self.range_stop,
            slots: RwLock::new(Slots {
                a: Some(b),
                ..Slots::empty()
            }),
            resizing: Mutex::new(false),
        });
        {
            let mut slots = self.slots.write();
            slots.c = Some(c);
            slots.d = Some(d);
            slots.a = None;
            slots.b = None;
        }
        *self.resizing.lock() = false;
    }

    /// Merge both children's stores back into this node. Refused when any
    /// involved node is already resizing or further split.
    fn unsplit(self: Arc<Self>, cores: usize) {
        let (c, d) = {
            let mut resizing = self.resizing.lock();
            if *resizing {
                return;
            }
            let slots = self.slots.read().clone();
            let (Some(c), Some(d)) = (slots.c, slots.d) else {
                return;
            };
            {
                let mut c_resizing = c.resizing.lock();
                if *c_resizing || c.slots.read().c.is_some() {
                    return;
                }
                let mut d_resizing = d.resizing.lock();
                if *d_resizing || d.slots.read().c.is_some() {
                    return;
                }
                *resizing = true;
                *c_resizing = true;
                *d_resizing = true;
            }
            (c, d)
        };
        let a = c.slots.read().a.clone();
        let e = d.slots.read().a.clone();
        let (Some(a), Some(e)) = (a, e) else {
            *c.resizing.lock() = false;
            *d.resizing.lock() = false;
            *self.resizing.lock() = false;
            return;
        };
        // Publish this node as the leaf first so readers entering the
        // children after their stores are detached restart into it.
        {
            let mut slots = self.slots.write();
            slots.a = Some(a.clone());
            slots.e = Some(e.clone());
            slots.b = None;
            slots.c = None;
            slots.d = None;
        }
        c.slots.write().a = None;
        d.slots.write().a = None;

        // Entries always move from e into a, since readers and writers
        // treat a as primary and e as fallback.
        let mut passes = 0;
        loop {
            let (copies, _) = migrate(&e, &a, cores, None, false);
            passes += 1;
            if passes >= 2 && copies == 0 {
                break;
            }
        }
        passes = 0;
        loop {
            let (copies, clears) = migrate(&e, &a, cores, None, true);
            passes += 1;
            if passes >= 2 && copies == 0 && clears == 0 {
                break;
            }
        }

        self.slots.write().e = None;
        *c.resizing.lock() = false;
        *d.resizing.lock() = false;
        *self.resizing.lock() = false;
    }
}

/// One migration pass from `src` into `dst` across `cores` workers, each
/// owning every `cores`-th stripe. With `right_of` set, only entries whose
/// key_a has that bit move (split); otherwise everything moves (unsplit).
/// Collisions merge by higher timestamp. With `clear` set, migrated source
/// entries are freed. Returns (copies, clears) performed.
fn migrate<K: StoreKey>(
    src: &Arc<LocStore<K>>,
    dst: &Arc<LocStore<K>>,
    cores: usize,
    right_of: Option<u64>,
    clear: bool,
) -> (u64, u64) {
    let copies = AtomicU64::new(0);
    let clears = AtomicU64::new(0);
    let lock_count = src.lock_count();
    let workers = cores.clamp(1, lock_count);
    thread::scope(|scope| {
        for core in 0..workers {
            let copies = &copies;
            let clears = &clears;
            scope.spawn(move || {
                let mut lix = core;
                while lix < lock_count {
                    migrate_stripe(src, dst, lix, right_of, clear, copies, clears);
                    lix += workers;
                }
            });
        }
    });
    (
        copies.load(Ordering::Relaxed),
        clears.load(Ordering::Relaxed),
    )
}

fn migrate_stripe<K: StoreKey>(
    src: &Arc<LocStore<K>>,
    dst: &Arc<LocStore<K>>,
    lix: usize,
    right_of: Option<u64>,
    clear: bool,
    copies: &AtomicU64,
    clears: &AtomicU64,
) {
    // Split migration moves a -> b and locks (b, a) like writers during a
    // split; unsplit moves e -> a and locks (a, e) like writers during an
    // unsplit. Either way the destination locks first.
    let mut dg = dst.stripes[lix].write();
    let mut sg = src.stripes[lix].write();
    for sub in 0..sg.buckets.len() {
        for si in 0..sg.buckets[sub].len() {
            let se = sg.buckets[sub][si];
            if se.block_id == 0 {
                continue;
            }
            if let Some(mask) = right_of {
                if se.key.key_a() & mask == 0 {
                    continue;
                }
            }
            let mut matched = false;
            let mut unused: Option<usize> = None;
            for (di, de) in dg.buckets[sub].iter_mut().enumerate() {
                if de.block_id == 0 {
                    if unused.is_none() {
                        unused = Some(di);
                    }
                    continue;
                }
                if de.key == se.key {
                    if se.timestamp > de.timestamp {
                        *de = se;
                        copies.fetch_add(1, Ordering::Relaxed);
                    }
                    matched = true;
                    break;
                }
            }
            if !matched {
                dst.used.fetch_add(1, Ordering::AcqRel);
                match unused {
                    Some(di) => dg.buckets[sub][di] = se,
                    None => dg.buckets[sub].push(se),
                }
                copies.fetch_add(1, Ordering::Relaxed);
            }
            if clear {
                src.used.fetch_sub(1, Ordering::AcqRel);
                sg.buckets[sub][si].block_id = 0;
                clears.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
